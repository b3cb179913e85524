/*!
Builders for the tagged line format spoken by workers:
`[<tag>] [<severity>] [<timestamp>] <message>`
*/

/// Builds worker lines stamped with the current local time.
pub struct LineBuilder;

impl LineBuilder {
    fn now() -> String {
        chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }

    pub fn line(tag: &str, severity: &str, message: &str) -> String {
        format!("[{tag}] [{severity}] [{}] {message}", Self::now())
    }

    /// Heartbeat-channel line keeping `instance_id` fresh.
    pub fn heartbeat(instance_id: &str) -> String {
        Self::line(instance_id, "INFO", "Heartbeat")
    }

    /// Heartbeat-channel line announcing a clean departure.
    pub fn exit(instance_id: &str) -> String {
        Self::line(instance_id, "INFO", "Exit")
    }

    pub fn info(app: &str, message: &str) -> String {
        Self::line(app, "INFO", message)
    }

    pub fn error(app: &str, message: &str) -> String {
        Self::line(app, "ERROR", message)
    }

    pub fn fatal(app: &str, message: &str) -> String {
        Self::line(app, "FATAL", message)
    }
}
