pub mod fixtures;
pub mod mock_broker;
pub mod rabbitmq;
pub mod recording;

pub use mock_broker::{MockBroker, MockTransport, PublishedMessage};
pub use rabbitmq::RabbitMq;
pub use recording::{RecordingPublisher, RecordingWriter};

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::fixtures;

    #[test]
    fn fixture_root_exists() {
        assert!(fixtures::root().is_dir());
    }

    #[test]
    fn loads_contact_fixture() {
        let contact = fixtures::contact("create-full.json");
        let json: serde_json::Value =
            serde_json::from_slice(&contact).expect("create-full.json should be valid json");
        assert_eq!(json["operation"], "create_or_update");
    }

    #[test]
    fn loads_config_fixture() {
        let config = fixtures::config("minimal-config.toml");
        let toml: toml::Value =
            toml::from_str(&config).expect("minimal-config.toml should be valid toml");
        assert!(toml.is_table());
    }

    #[test]
    fn mock_brokers_get_distinct_hosts() {
        let first = super::MockBroker::start();
        let second = super::MockBroker::start();
        assert_ne!(first.host(), second.host());
        assert!(first.deliver(b"nobody listening".to_vec()).is_none());
        first.stop();
        second.stop();
    }
}
