use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use eventhub::EventHubConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "sample-events")]
    pub entity_name: String,

    // Empty means an anonymous consumer group
    #[envconfig(default = "sample-group")]
    pub consumer_group: String,

    #[envconfig(default = "memory")]
    pub backend: Backend,

    #[envconfig(default = "4")]
    pub memory_partitions: usize,

    #[envconfig(default = "1000")]
    pub send_interval_ms: u64,

    #[envconfig(default = "false")]
    pub log_json: bool,

    pub metrics_port: Option<u16>,

    #[envconfig(nested = true)]
    pub eventhub: EventHubConfig,
}

impl Config {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn consumer_group(&self) -> Option<String> {
        Some(self.consumer_group.trim().to_string()).filter(|g| !g.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Kafka,
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(Backend::Kafka),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.consumer_group(), Some("sample-group".to_string()));
        assert_eq!(config.send_interval(), Duration::from_secs(1));
        assert_eq!(config.eventhub.eventhub_max_batch_size, 100);
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("BACKEND".to_string(), "Kafka".to_string()),
            ("CONSUMER_GROUP".to_string(), " ".to_string()),
            ("EVENTHUB_START_POSITION".to_string(), "earliest".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.backend, Backend::Kafka);
        assert_eq!(config.consumer_group(), None);
        assert_eq!(
            config.eventhub.eventhub_start_position,
            eventhub::StartPosition::Earliest
        );
    }
}
