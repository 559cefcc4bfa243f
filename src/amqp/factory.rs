use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::rabbit_mq::LapinConnection;
use crate::transport::{AmqpConnection, TransportError, TransportFactory};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;

/// Used when `connection_timeout_seconds` is left unspecified.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// Fails if the TLS configuration cannot be turned into a connector.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.amqp_uri().authority.host);

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;
                Ok(Tls {
                    domain_name,
                    connector,
                })
            })
            .transpose()?;
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS Connector, along with the expected domain name for the certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if TLS is configured.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<LapinConnection, TransportError> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connect = async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        let connection = tokio::time::timeout(self.connection_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(LapinConnection::new(connection))
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake with our own expectations
                // for the server certificate domain.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri.connect().and_then(|tcp| {
                    tcp.into_native_tls(
                        &tls_configuration.connector,
                        &tls_configuration.domain_name,
                    )
                })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl TransportFactory for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        Ok(Arc::new(self.new_connection().await?))
    }
}
