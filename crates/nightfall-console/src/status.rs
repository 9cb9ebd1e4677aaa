use nightfall_link::LinkView;

/// One-line summary. A trailing `*` on the autonomy flag marks an unconfirmed
/// prediction.
pub fn render_status_line(view: &LinkView) -> String {
    let telemetry = &view.telemetry;
    let stats = &view.stats;
    let autonomy = if view.effective_autonomous() { "on" } else { "off" };
    let pending = if view.predicted_autonomous.is_some() { "*" } else { "" };

    let mut line = format!(
        "[{}] {} msg/s | attempts {} | fsm {} | auto {autonomy}{pending} | front {:.1}cm rear {:.1}cm | gas {:.0}ppm",
        view.status,
        stats.msg_rate,
        stats.reconnect_attempts,
        telemetry.state.fsm,
        telemetry.sensors.front_dist,
        telemetry.sensors.rear_dist,
        telemetry.sensors.gas,
    );
    if let Some(latency) = stats.last_latency_ms {
        line.push_str(&format!(" | latency {latency}ms"));
    }
    if let Some(error) = stats.last_error {
        line.push_str(&format!(" | error {error}"));
    }
    line
}
