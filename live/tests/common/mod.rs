//! Shared helpers for ripple-live integration tests.

#![allow(dead_code)]

use ripple_engine::{ObjectSchema, PropertyDescriptor, PropertyType, Schema};
use ripple_live::{Config, Database};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Set `RUST_LOG` to
/// override the default filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ripple_live=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Dogs with an age and a color, owners with a list of dogs and a
/// favorite dog.
pub fn schema() -> Schema {
    Schema::new(1)
        .with_object(ObjectSchema::new(
            "dogs",
            "name",
            vec![
                PropertyDescriptor::optional("age", PropertyType::Int),
                PropertyDescriptor::optional("color", PropertyType::String),
            ],
        ))
        .with_object(ObjectSchema::new(
            "owners",
            "name",
            vec![
                PropertyDescriptor::list("dogs", "dogs"),
                PropertyDescriptor::link("favorite", "dogs"),
            ],
        ))
}

pub fn open() -> Database {
    open_with(Config::default())
}

pub fn open_with(config: Config) -> Database {
    init_tracing();
    Database::open(schema(), config).unwrap()
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
