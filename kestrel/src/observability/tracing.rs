//! Reporting of traced requests.
//!
//! A request sent with a [`Tracer`] asks the node to record a trace. The
//! tracing session id the node returns is handed to the tracer once the
//! response arrives.

use std::fmt::Write as _;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use kestrel_cql::value::Unmarshal;
use kestrel_cql::Consistency;
use tracing::warn;
use uuid::Uuid;

use crate::client::session::{Session, SessionInner};

pub(crate) const TRACES_SESSION_QUERY_STR: &str =
    "SELECT coordinator, duration FROM system_traces.sessions WHERE session_id = ?";

pub(crate) const TRACES_EVENTS_QUERY_STR: &str =
    "SELECT event_id, activity, source, source_elapsed FROM system_traces.events WHERE session_id = ?";

/// Receives the tracing session id of every traced request.
#[async_trait]
pub trait Tracer: Send + Sync {
    /// Called once the traced request completed.
    async fn trace(&self, tracing_id: Uuid);
}

/// A [`Tracer`] that reads the trace back from `system_traces` and prints
/// it to a writer, one line per event:
///
/// ```text
/// Tracing session 5c0b4c30a1f211eeb2c6a1b2c3d4e5f6 (coordinator: 127.0.0.1, duration: 1.2ms):
/// 2024/01/02 15:04:05.000123: Parsing SELECT * FROM t (source: 127.0.0.1, elapsed: 63)
/// ```
pub struct TraceWriter {
    session: Weak<SessionInner>,
    writer: StdMutex<Box<dyn Write + Send>>,
}

impl TraceWriter {
    /// Creates a writer reading traces through `session`.
    pub fn new(session: &Session, writer: impl Write + Send + 'static) -> Self {
        TraceWriter {
            session: session.downgrade(),
            writer: StdMutex::new(Box::new(writer)),
        }
    }

    async fn format_trace(session: &Session, tracing_id: Uuid) -> String {
        let mut coordinator = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut duration = 0_i32;
        // A trace that is not written yet is printed with empty fields.
        let _ = session
            .query(TRACES_SESSION_QUERY_STR, (tracing_id,))
            .consistency(Consistency::One)
            .trace(None)
            .scan(&mut [&mut coordinator as &mut dyn Unmarshal, &mut duration])
            .await;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Tracing session {} (coordinator: {}, duration: {:?}):",
            tracing_id.simple(),
            coordinator,
            Duration::from_micros(duration.max(0) as u64)
        );

        let mut iter = session
            .query(TRACES_EVENTS_QUERY_STR, (tracing_id,))
            .consistency(Consistency::One)
            .trace(None)
            .iter()
            .await;
        let mut event_id = Uuid::nil();
        let mut activity = String::new();
        let mut source = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut elapsed = 0_i32;
        while iter
            .scan(&mut [
                &mut event_id as &mut dyn Unmarshal,
                &mut activity,
                &mut source,
                &mut elapsed,
            ])
            .await
        {
            let _ = writeln!(
                out,
                "{}: {} (source: {}, elapsed: {})",
                event_time(&event_id),
                activity,
                source,
                elapsed
            );
        }
        if let Err(err) = iter.close() {
            let _ = writeln!(out, "Error: {}", err);
        }
        out
    }
}

// Wall clock time embedded in a time-based uuid, in UTC.
fn event_time(event_id: &Uuid) -> String {
    event_id
        .get_timestamp()
        .and_then(|timestamp| {
            let (seconds, nanos) = timestamp.to_unix();
            DateTime::from_timestamp(seconds as i64, nanos)
        })
        .map(|time| time.format("%Y/%m/%d %H:%M:%S%.6f").to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Tracer for TraceWriter {
    async fn trace(&self, tracing_id: Uuid) {
        let Some(session) = Session::upgrade(&self.session) else {
            return;
        };
        let report = Self::format_trace(&session, tracing_id).await;
        let mut writer = self.writer.lock().unwrap();
        let written = writer.write_all(report.as_bytes());
        if let Err(err) = written.and_then(|_| writer.flush()) {
            warn!("Failed to write trace {}: {}", tracing_id, err);
        }
    }
}
