//! Redis-backed store using the `redis` crate's multiplexed async connections

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Connector, KeyChange, NotificationStream, RemoteStore, Session, VALUE_FIELD};
use crate::config::RedisSection;
use crate::error::RemoteError;

/// One multiplexed command connection
pub struct RedisStore {
  connection: MultiplexedConnection,
}

impl RedisStore {
  pub async fn open(client: &Client) -> Result<Self, RemoteError> {
    let connection = client.get_multiplexed_async_connection().await?;
    Ok(Self { connection })
  }
}

#[async_trait]
impl RemoteStore for RedisStore {
  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, RemoteError> {
    let mut conn = self.connection.clone();
    let value: Option<String> = conn.hget(key, field).await?;
    Ok(value)
  }

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, RemoteError> {
    let mut conn = self.connection.clone();
    let fields: HashMap<String, String> = conn.hgetall(key).await?;
    Ok(fields)
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
    let mut conn = self.connection.clone();
    let keys: Vec<String> = conn.keys(pattern).await?;
    Ok(keys)
  }

  async fn publish_set(&self, key: &str, raw: &str, publisher: &str) -> Result<(), RemoteError> {
    let mut conn = self.connection.clone();
    ::redis::pipe()
      .atomic()
      .hset(key, VALUE_FIELD, raw)
      .ignore()
      .publish(publisher, key)
      .ignore()
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    let mut conn = self.connection.clone();
    ::redis::cmd("PING").query_async::<()>(&mut conn).await?;
    Ok(())
  }
}

/// Opens reader, publisher and subscription connections to one server
pub struct RedisConnector {
  client: Client,
}

impl RedisConnector {
  pub fn new(section: &RedisSection) -> Result<Self, RemoteError> {
    let client = Client::open(section.connection_url())?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Connector for RedisConnector {
  async fn connect(&self) -> Result<Session, RemoteError> {
    let reader: Arc<dyn RemoteStore> = Arc::new(RedisStore::open(&self.client).await?);
    let publisher: Arc<dyn RemoteStore> = Arc::new(RedisStore::open(&self.client).await?);
    reader.ping().await?;
    Ok(Session { reader, publisher })
  }

  async fn subscribe(&self, patterns: &[String]) -> Result<NotificationStream, RemoteError> {
    let mut pubsub = self.client.get_async_pubsub().await?;
    for pattern in patterns {
      pubsub.psubscribe(pattern).await?;
    }
    let stream = pubsub
      .into_on_message()
      .map(|msg| -> Result<KeyChange, RemoteError> {
        let channel = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload()?;
        Ok(KeyChange::new(channel, payload))
      });
    Ok(stream.boxed())
  }
}
