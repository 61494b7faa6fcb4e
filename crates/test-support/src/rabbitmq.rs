//! Disposable RabbitMQ broker for end-to-end tests (requires Docker).

use syncwire_core::config::BrokerConfig;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt, TestcontainersError};

const RABBITMQ_IMAGE: &str = "rabbitmq";
const RABBITMQ_TAG: &str = "3.13-alpine";
const AMQP_PORT: u16 = 5672;
const USERNAME: &str = "syncwire";
const PASSWORD: &str = "syncwire";

#[derive(Debug, thiserror::Error)]
#[error("failed to start RabbitMQ container: {0}")]
pub struct RabbitMqError(#[from] TestcontainersError);

pub struct RabbitMq {
    // Dropping the handle stops the container.
    _container: ContainerAsync<GenericImage>,
    host: String,
    port: u16,
}

impl RabbitMq {
    pub async fn start() -> Result<Self, RabbitMqError> {
        let container = GenericImage::new(RABBITMQ_IMAGE, RABBITMQ_TAG)
            .with_exposed_port(AMQP_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete"))
            .with_env_var("RABBITMQ_DEFAULT_USER", USERNAME)
            .with_env_var("RABBITMQ_DEFAULT_PASS", PASSWORD)
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(AMQP_PORT.tcp()).await?;

        Ok(Self {
            _container: container,
            host,
            port,
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.host.clone(),
            port: self.port,
            username: USERNAME.to_string(),
            password: PASSWORD.to_string(),
            virtual_host: "/".to_string(),
            use_tls: false,
            heartbeat_seconds: 10,
            connect_timeout_seconds: 10,
        }
    }
}
