pub const DEFAULT_QUEUE: &str = "analyze.default";
pub const EMERGENCY_QUEUE: &str = "analyze.emergency";

/// Marker in `image_id` that sends a submission to the emergency queue.
const EMERGENCY_MARKER: &str = "emergency";

/// Picks the queue a submission is routed to.
#[derive(Debug, Clone)]
pub struct QueueRouter {
    default_queue: String,
    emergency_queue: String,
}

impl QueueRouter {
    pub fn new(default_queue: impl Into<String>, emergency_queue: impl Into<String>) -> Self {
        Self {
            default_queue: default_queue.into(),
            emergency_queue: emergency_queue.into(),
        }
    }

    /// Case-sensitive substring match on the image id.
    pub fn route(&self, image_id: &str) -> &str {
        if image_id.contains(EMERGENCY_MARKER) {
            &self.emergency_queue
        } else {
            &self.default_queue
        }
    }

    /// Queues in the order a worker should drain them.
    pub fn priority_order(&self) -> Vec<String> {
        vec![self.emergency_queue.clone(), self.default_queue.clone()]
    }
}

impl Default for QueueRouter {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE, EMERGENCY_QUEUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emergency_substring_routes_to_emergency_queue() {
        let router = QueueRouter::default();
        assert_eq!(router.route("emergency_cam3.jpg"), EMERGENCY_QUEUE);
        assert_eq!(router.route("cam3_emergency.png"), EMERGENCY_QUEUE);
        assert_eq!(router.route("nonemergencyish"), EMERGENCY_QUEUE);
    }

    #[test]
    fn test_other_ids_route_to_default_queue() {
        let router = QueueRouter::default();
        assert_eq!(router.route("lobby_cam1.jpg"), DEFAULT_QUEUE);
        assert_eq!(router.route(""), DEFAULT_QUEUE);
        assert_eq!(router.route("fire_002.jpg"), DEFAULT_QUEUE);
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let router = QueueRouter::default();
        assert_eq!(router.route("EMERGENCY_cam3.jpg"), DEFAULT_QUEUE);
        assert_eq!(router.route("Emergency.jpg"), DEFAULT_QUEUE);
    }

    #[test]
    fn test_custom_queue_names() {
        let router = QueueRouter::new("low", "high");
        assert_eq!(router.route("emergency"), "high");
        assert_eq!(router.route("hall"), "low");
        assert_eq!(router.priority_order(), vec!["high".to_string(), "low".to_string()]);
    }
}
