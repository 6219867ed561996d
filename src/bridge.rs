//! Redis implementation of the outside interface.
//!
//! Values are plain strings on the selected database. Inbound write
//! commands are observed through keyspace notifications: channel
//! `__keyspace@<db>__:<key>`, filtered to `set` events.

use std::sync::mpsc::{channel, Receiver};
use std::sync::Mutex;
use std::thread;

use log::{debug, info, warn};
use redis::Commands;

use crate::error::Result;
use crate::outside::{OutsideInterface, SubMessage};
use crate::settings::RedisSettings;

pub struct RedisBridge {
    client: redis::Client,
    connection: Mutex<redis::Connection>,
    channel_prefix: String,
}

impl RedisBridge {
    pub fn open(settings: &RedisSettings) -> Result<RedisBridge> {
        let url = format!("redis://{}/{}", settings.address, settings.db);
        let client = redis::Client::open(url.as_str())?;
        let mut connection = client.get_connection()?;
        // subscriptions need keyspace events; a managed server may refuse
        // CONFIG, in which case they must be enabled server-side
        let enabled: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query(&mut connection);
        if let Err(e) = enabled {
            warn!("could not enable keyspace notifications: {}", e);
        }
        info!("connected to redis at {} db {}", settings.address, settings.db);
        Ok(RedisBridge {
            client,
            connection: Mutex::new(connection),
            channel_prefix: format!("__keyspace@{}__:", settings.db),
        })
    }
}

impl OutsideInterface for RedisBridge {
    fn update(&self, key: &str, value: &str) {
        let result: redis::RedisResult<()> = self.connection.lock().unwrap().set(key, value);
        match result {
            Ok(()) => debug!("published {} = {:?}", key, value),
            Err(e) => warn!("publishing {} failed: {}", key, e),
        }
    }

    fn subscribe_writes(&self, key: &str) -> Result<Receiver<SubMessage>> {
        let (sender, receiver) = channel();
        let mut query_connection = self.client.get_connection()?;
        let pubsub_connection = self.client.get_connection()?;
        let channel_name = format!("{}{}", self.channel_prefix, key);
        let key = key.to_string();

        // seed with the current value; absent keys are created empty so
        // the commanding side has a known slot
        let current: Option<String> = query_connection.get(&key)?;
        match current {
            Some(value) => {
                sender.send(SubMessage { key: key.clone(), value }).ok();
            }
            None => {
                let _: () = query_connection.set(&key, "")?;
            }
        }

        let thread_key = key.clone();
        thread::Builder::new()
            .name(format!("kv {}", key))
            .spawn(move || {
                let mut pubsub_connection = pubsub_connection;
                let mut pubsub = pubsub_connection.as_pubsub();
                if let Err(e) = pubsub.subscribe(&channel_name) {
                    warn!("subscription to {} failed: {}", channel_name, e);
                    return;
                }
                loop {
                    let message = match pubsub.get_message() {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("subscription to {} broke: {}", channel_name, e);
                            return;
                        }
                    };
                    let event: String = match message.get_payload() {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("unreadable event on {}: {}", channel_name, e);
                            continue;
                        }
                    };
                    if event != "set" {
                        continue;
                    }
                    let value: Option<String> = match query_connection.get(&thread_key) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("reading {} back failed: {}", thread_key, e);
                            continue;
                        }
                    };
                    let delivered = sender.send(SubMessage {
                        key: thread_key.clone(),
                        value: value.unwrap_or_default(),
                    });
                    if delivered.is_err() {
                        // receiver gone, the entry was dropped
                        return;
                    }
                }
            })?;
        Ok(receiver)
    }
}
