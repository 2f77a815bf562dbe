//! Common test infrastructure for Redis integration tests.

use groupmq::{GroupMqConfig, Queue, RedisConfig, SharedClock};
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// GroupMQ needs Redis >= 6.2 (see DESIGN.md); the module's default tag is 5.0.
const REDIS_TAG: &str = "7.2";

/// Test Redis container wrapper.
///
/// Manages a Redis testcontainer lifecycle and hands out queues bound to it.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    url: String,
}

impl TestRedis {
    /// Creates a fresh Redis container.
    pub async fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let container = Redis::default()
            .with_tag(REDIS_TAG)
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        Self {
            _container: container,
            url: format!("redis://127.0.0.1:{}", port),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens a queue against the container using the system clock.
    pub async fn queue(&self, name: &str) -> Queue {
        Queue::connect(&self.url, name)
            .await
            .expect("Failed to connect queue")
    }

    /// Opens a queue with an injected clock, for tests that steer time.
    pub async fn queue_with_clock(&self, name: &str, clock: SharedClock) -> Queue {
        let config = GroupMqConfig {
            redis: RedisConfig {
                url: self.url.clone(),
                ..RedisConfig::default()
            },
            ..GroupMqConfig::default()
        };
        Queue::connect_with(&config, name, clock)
            .await
            .expect("Failed to connect queue")
    }
}
