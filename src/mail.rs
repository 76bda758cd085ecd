//! Send emails to users through a RabbitMQ queue of CloudEvents.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, RecoveryConfig,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;
use crate::user::User;

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

type Result<T> = std::result::Result<T, MailError>;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid address: {0}")]
    Url(#[from] url::ParseError),
    #[error("scheme must be `amqp` or `amqps`")]
    InvalidScheme,
    #[cfg(test)]
    #[error("mail queue unreachable")]
    Unreachable,
}

/// Mail templates list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Greets a freshly registered user.
    Welcome,
    /// Carries an email confirmation link.
    VerifyEmail,
    /// Carries a password reset link.
    ResetPassword,
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    locale: Cow<'a, str>,
    to: Cow<'a, str>,
    template: Template,
    username: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<Cow<'a, str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in_minutes: Option<u64>,
}

/// Time-limited link attached to a mail.
#[derive(Debug, Clone, Copy)]
pub struct Link<'a> {
    pub url: &'a str,
    pub lifetime: Duration,
}

/// Events published in tests, as `(template, recipient)` pairs.
#[cfg(test)]
pub(crate) type Outbox = Arc<std::sync::Mutex<Vec<(Template, String)>>>;

#[derive(Debug, Clone, Default)]
enum Transport {
    #[default]
    Disabled,
    Amqp(Arc<Connection>),
    #[cfg(test)]
    Memory(Outbox),
    #[cfg(test)]
    Unreachable,
}

/// Mail instance manager. Without a connection, events are dropped.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    transport: Transport,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail) -> Result<Self> {
        let addr = Url::parse(&config.address)?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme())
                .map_err(|_| MailError::InvalidScheme)?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let recovery_config =
            RecoveryConfig::default().auto_recover_connection();
        let conn_config = ConnectionProperties::default()
            .with_connection_name("lexica_mail_client".into())
            .with_experimental_recovery_config(recovery_config);
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(%addr, queue = %config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            transport: Transport::Amqp(Arc::new(conn)),
        })
    }

    /// Manager recording events in memory.
    #[cfg(test)]
    pub(crate) fn memory() -> (Self, Outbox) {
        let outbox = Arc::default();
        let manager = Self {
            queue: String::new(),
            transport: Transport::Memory(Arc::clone(&outbox)),
        };

        (manager, outbox)
    }

    /// Manager failing every publication.
    #[cfg(test)]
    pub(crate) fn unreachable() -> Self {
        Self {
            queue: String::new(),
            transport: Transport::Unreachable,
        }
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    fn create_event(data: Content) -> Cloudevent {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "com.lexica.email",
            source: "com.lexica.api",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }

    /// Publish a mail event for a specific user.
    pub async fn publish_event(
        &self,
        template: Template,
        user: &User,
        link: Option<Link<'_>>,
    ) -> Result<()> {
        let conn = match &self.transport {
            Transport::Disabled => {
                tracing::debug!(?template, to = %user.email, "no mail queue, event dropped");
                return Ok(());
            },
            Transport::Amqp(conn) => conn,
            #[cfg(test)]
            Transport::Memory(outbox) => {
                outbox.lock().unwrap().push((template, user.email.clone()));
                return Ok(());
            },
            #[cfg(test)]
            Transport::Unreachable => return Err(MailError::Unreachable),
        };
        let channel =
            Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let payload = serde_json::to_string(&Self::create_event(
            Self::content(template, user, link),
        ))?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(?template, "event sent");

        Ok(())
    }

    fn content<'a>(
        template: Template,
        user: &'a User,
        link: Option<Link<'a>>,
    ) -> Content<'a> {
        Content {
            locale: Cow::from(&user.locale),
            to: Cow::from(&user.email),
            template,
            username: Cow::from(&user.username),
            link: link.map(|link| Cow::from(link.url)),
            expires_in_minutes: link.map(|link| link.lifetime.as_secs() / 60),
        }
    }
}
