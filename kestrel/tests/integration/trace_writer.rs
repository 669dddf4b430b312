use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kestrel::frame::ColumnType;
use kestrel::{TraceWriter, Tracer};
use uuid::Uuid;

use crate::utils::{setup_tracing, MockNode, Table};

const SESSIONS: &str =
    "SELECT coordinator, duration FROM system_traces.sessions WHERE session_id = ?";
const EVENTS: &str =
    "SELECT event_id, activity, source, source_elapsed FROM system_traces.events WHERE session_id = ?";

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn add_trace_tables(node: &MockNode) {
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    node.add_table(
        SESSIONS,
        Table::new(&[("coordinator", ColumnType::Inet), ("duration", ColumnType::Int)])
            .args(&[ColumnType::Uuid])
            .row(&[&localhost, &1200_i32]),
    );
    let event_id = Uuid::parse_str("a8485680-7277-11e3-8080-808080808080").unwrap();
    node.add_table(
        EVENTS,
        Table::new(&[
            ("event_id", ColumnType::TimeUuid),
            ("activity", ColumnType::Text),
            ("source", ColumnType::Inet),
            ("source_elapsed", ColumnType::Int),
        ])
        .args(&[ColumnType::Uuid])
        .row(&[&event_id, &"Parsing", &localhost, &63_i32]),
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn trace_is_read_back_and_printed() {
    setup_tracing();
    let node = MockNode::start().await;
    let trace_id = Uuid::new_v4();
    node.set_trace_id(trace_id);
    add_trace_tables(&node);
    let session = node.session().await;
    let buffer = SharedBuffer::default();
    let writer: Arc<dyn Tracer> = Arc::new(TraceWriter::new(&session, buffer.clone()));

    session
        .query("CREATE TABLE t (a int PRIMARY KEY)", ())
        .trace(Some(writer))
        .exec()
        .await
        .unwrap();

    assert_eq!(
        buffer.contents(),
        format!(
            "Tracing session {} (coordinator: 127.0.0.1, duration: 1.2ms):\n\
             2014/01/01 00:00:00.123456: Parsing (source: 127.0.0.1, elapsed: 63)\n",
            trace_id.simple()
        )
    );
    // Reading the trace back is not traced itself.
    assert_eq!(buffer.contents().matches("Tracing session").count(), 1);
}

#[derive(Default)]
struct Collecting(Mutex<Vec<Uuid>>);

#[async_trait]
impl Tracer for Collecting {
    async fn trace(&self, tracing_id: Uuid) {
        self.0.lock().unwrap().push(tracing_id);
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn session_tracer_applies_to_new_queries() {
    setup_tracing();
    let node = MockNode::start().await;
    let trace_id = Uuid::new_v4();
    node.set_trace_id(trace_id);
    let session = node.session().await;
    let tracer = Arc::new(Collecting::default());

    session.set_trace(Some(tracer.clone()));
    session.query("SELECT a FROM t", ()).exec().await.unwrap();
    session.set_trace(None);
    session.query("SELECT a FROM t", ()).exec().await.unwrap();

    // The PREPARE and the EXECUTE of the first query were both traced.
    assert_eq!(*tracer.0.lock().unwrap(), vec![trace_id, trace_id]);
}
