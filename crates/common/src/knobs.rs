//! Tunable limits and parameters for the enrollment daemon.
//!
//! Every knob here can be overridden with an environment variable of the
//! same name. Each one should have a comment explaining what it's for so an
//! operator can adjust it safely.

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Capacity of the bounded queue between the TLS listener and the
/// enrollment dispatcher. Sockets accepted while the queue is full are
/// dropped (admission control is drop-newest).
pub static AUTH_POOL: LazyLock<usize> = LazyLock::new(|| env_config("AUTH_POOL", 1000));

/// Hard ceiling on the number of enrolled agents. The effective limit is
/// `MAX_AGENTS - 2`; it can be disabled entirely from the command line.
pub static MAX_AGENTS: LazyLock<usize> = LazyLock::new(|| env_config("MAX_AGENTS", 2048));

/// How many numeric suffixes (`name2`, `name3`, ...) to try before giving
/// up on deduplicating an agent name.
pub static MAX_TAG_COUNTER: LazyLock<u32> = LazyLock::new(|| env_config("MAX_TAG_COUNTER", 256));

/// Maximum number of groups a single multigroup assignment may name.
pub static MAX_GROUPS_PER_MULTIGROUP: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_GROUPS_PER_MULTIGROUP", 128));

/// Maximum length of a single group name.
pub static GROUP_NAME_MAX: LazyLock<usize> = LazyLock::new(|| env_config("GROUP_NAME_MAX", 255));

/// Maximum total length of a comma-delimited multigroup string.
pub static MULTIGROUP_NAME_MAX: LazyLock<usize> =
    LazyLock::new(|| env_config("MULTIGROUP_NAME_MAX", 4096));

/// Maximum length of an agent name.
pub static AGENT_NAME_MAX: LazyLock<usize> = LazyLock::new(|| env_config("AGENT_NAME_MAX", 128));

/// Size of the buffer a single enrollment request is read into. The whole
/// request must fit in one read.
pub static REQUEST_BUFFER_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("REQUEST_BUFFER_SIZE", 65536 + 4096));

/// How long to sleep before retrying a TLS operation that failed with a
/// timeout-class error. Retried exactly once.
pub static SSL_RETRY_DELAY_MILLIS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SSL_RETRY_DELAY_MILLIS", 100)));

/// Initial pause before the writer retries a failed credential-file
/// flush. Doubles per consecutive failure.
pub static WRITE_RETRY_DELAY_MILLIS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("WRITE_RETRY_DELAY_MILLIS", 500)));

/// Cap for the writer's flush-retry pause.
pub static MAX_WRITE_RETRY_DELAY_SECONDS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("MAX_WRITE_RETRY_DELAY_SECONDS", 30)));

/// Base interval between integrity synchronization rounds.
pub static SYNC_INTERVAL_SECONDS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SYNC_INTERVAL_SECONDS", 300)));

/// Cap for the integrity sync interval after repeated unsuccessful rounds.
pub static MAX_SYNC_INTERVAL_SECONDS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("MAX_SYNC_INTERVAL_SECONDS", 3600)));

/// Extra margin granted after each peer response before an integrity round
/// is considered settled.
pub static SYNC_RESPONSE_TIMEOUT_SECONDS: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SYNC_RESPONSE_TIMEOUT_SECONDS", 30)));

/// Capacity of the integrity synchronizer's response queue. Responses
/// arriving while it is full are dropped.
pub static SYNC_QUEUE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("SYNC_QUEUE_SIZE", 16384));

/// Compatibility switch: when on, every enrollment rejection is followed by
/// a second generic `ERROR: Unable to add agent.` line on the wire, which
/// old agents may depend on. Turn off to send a single error message.
pub static LEGACY_DOUBLE_ERROR_REPLY: LazyLock<bool> =
    LazyLock::new(|| env_config("LEGACY_DOUBLE_ERROR_REPLY", true));
