use std::collections::HashMap;
use std::fmt;

/// Container whose samples are stored at `metrics:node:{nodeId}:{kind}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Node application process
    Nodejs,
    JanusVideoroom,
    JanusStreaming,
    Gstreamer,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nodejs => "nodejs",
            Self::JanusVideoroom => "janusVideoroom",
            Self::JanusStreaming => "janusStreaming",
            Self::Gstreamer => "gstreamer",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One container sample as written by the metrics collector
///
/// Absent or unparsable fields read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSample {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub bandwidth_tx_mbps: f64,
    pub max_audio_queue_ms: f64,
    pub max_video_queue_ms: f64,
    pub janus_total_viewers: f64,
    pub janus_mountpoints_active: f64,
    /// Unix milliseconds of the sample, 0 when never written
    pub timestamp: i64,
}

impl MetricsSample {
    #[must_use]
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let float = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
        };

        Self {
            cpu_percent: float("cpuPercent"),
            memory_used_mb: float("memoryUsedMb"),
            bandwidth_tx_mbps: float("bandwidthTxMbps"),
            max_audio_queue_ms: float("maxAudioQueueMs"),
            max_video_queue_ms: float("maxVideoQueueMs"),
            janus_total_viewers: float("janusTotalViewers"),
            janus_mountpoints_active: float("janusMountpointsActive"),
            timestamp: fields
                .get("timestamp")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default_to_zero() {
        let sample = MetricsSample::from_fields(&HashMap::new());
        assert_eq!(sample, MetricsSample::default());
    }

    #[test]
    fn test_parse_sample() {
        let fields: HashMap<String, String> = [
            ("cpuPercent", "40.5"),
            ("maxAudioQueueMs", "120"),
            ("janusTotalViewers", "garbage"),
            ("timestamp", "1700000000000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let sample = MetricsSample::from_fields(&fields);
        assert!((sample.cpu_percent - 40.5).abs() < f64::EPSILON);
        assert!((sample.max_audio_queue_ms - 120.0).abs() < f64::EPSILON);
        assert_eq!(sample.janus_total_viewers, 0.0);
        assert_eq!(sample.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(MetricKind::JanusVideoroom.as_str(), "janusVideoroom");
        assert_eq!(MetricKind::Nodejs.to_string(), "nodejs");
    }
}
