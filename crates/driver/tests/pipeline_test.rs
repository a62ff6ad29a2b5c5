//! End-to-end: framed entries in, enriched JSON documents out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use driver::conf::DriverConfig;
use driver::pipeline::{ContainerInfo, PipelineManager, SenderFactory, SenderTarget};
use driver::sender::testing::RecordingSender;
use driver::sender::Sender;
use driver::store::ReadConfig;
use driver::transport::{FrameWriter, LogEntry, LogEntryCodec, PartialLogEntryMetadata};

struct Driver {
    dir: tempfile::TempDir,
    senders: Arc<Mutex<Vec<Arc<RecordingSender>>>>,
    manager: Arc<PipelineManager>,
}

fn driver() -> Driver {
    let dir = tempfile::tempdir().unwrap();
    let senders: Arc<Mutex<Vec<Arc<RecordingSender>>>> = Arc::default();
    let record = senders.clone();
    let factory: SenderFactory = Arc::new(move |_target: &SenderTarget| {
        let sender = Arc::new(RecordingSender::new());
        record.lock().push(sender.clone());
        Ok(sender as Arc<dyn Sender>)
    });
    let config = DriverConfig {
        log_root: dir.path().join("logs").display().to_string(),
        partial_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(20),
        ..DriverConfig::default()
    };
    Driver {
        dir,
        senders,
        manager: PipelineManager::new(config, factory),
    }
}

impl Driver {
    fn info(&self, id: &str, extra: &[(&str, &str)]) -> ContainerInfo {
        let mut config = HashMap::from([
            ("logzio-token".to_string(), "tok".to_string()),
            (
                "logzio-dir-path".to_string(),
                self.dir.path().join("spool").display().to_string(),
            ),
        ]);
        for (k, v) in extra {
            config.insert(k.to_string(), v.to_string());
        }
        ContainerInfo {
            id: id.to_string(),
            name: format!("/{}", id),
            image_name: "acme/web".to_string(),
            env: vec!["STAGE=prod".to_string(), "APP_REGION=eu".to_string()],
            labels: HashMap::from([("team".to_string(), "core".to_string())]),
            config,
            ..ContainerInfo::default()
        }
    }

    async fn start(&self, file: &str, info: ContainerInfo) -> FrameWriter<DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.manager.attach(file, info, Box::new(server)).await.unwrap();
        FrameWriter::new(client, LogEntryCodec::new())
    }

    /// Stop everything and return the JSON documents the sender received.
    async fn finish(&self) -> Vec<serde_json::Value> {
        self.manager.shutdown().await;
        self.senders.lock()[0].json()
    }
}

fn partial(source: &str, time: i64, line: &str, id: &str, ordinal: i32, last: bool) -> LogEntry {
    let mut entry = LogEntry::new(source, time, line);
    entry.partial_log_metadata = Some(PartialLogEntryMetadata {
        last,
        id: id.to_string(),
        ordinal,
    });
    entry
}

// ── enrichment ──────────────────────────────────────────────────

#[tokio::test]
async fn test_plain_lines_are_enriched() {
    let d = driver();
    let info = d.info(
        "0123456789abcdef",
        &[
            ("logzio-type", "nginx"),
            ("logzio-tag", "{{.Name}}/{{.ID}}"),
            ("labels", "team"),
            ("env", "STAGE"),
            ("logzio-attributes", r#"{"cluster":"blue"}"#),
        ],
    );
    let mut writer = d.start("fifo", info).await;
    writer.send(LogEntry::new("stdout", 1_500_000_000, "GET /")).await.unwrap();
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let docs = d.finish().await;
    assert_eq!(docs.len(), 1);
    let doc = &docs[0];
    assert_eq!(doc["message"], "GET /");
    assert_eq!(doc["type"], "nginx");
    assert_eq!(doc["log_source"], "stdout");
    assert_eq!(doc["tags"], "0123456789abcdef/0123456789ab");
    assert_eq!(doc["team"], "core");
    assert_eq!(doc["STAGE"], "prod");
    assert_eq!(doc["cluster"], "blue");
    assert_eq!(doc["@timestamp"], "1970-01-01T00:00:01.500Z");
    assert!(doc.get("APP_REGION").is_none());
    assert!(doc.get("lines").is_none());
    assert!(!doc["hostname"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_json_format_embeds_object() {
    let d = driver();
    let info = d.info("a", &[("logzio-format", "json"), ("env-regex", "^APP_")]);
    let mut writer = d.start("fifo", info).await;
    writer.send(LogEntry::new("stdout", 1, r#"{"level":"warn","n":3}"#)).await.unwrap();
    writer.send(LogEntry::new("stdout", 2, "not json")).await.unwrap();
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let docs = d.finish().await;
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["message"]["level"], "warn");
    assert_eq!(docs[0]["codec"], "json");
    assert_eq!(docs[0]["APP_REGION"], "eu");
    assert_eq!(docs[1]["message"], "not json");
    assert!(docs[1].get("codec").is_none());
}

// ── partial reassembly ──────────────────────────────────────────

#[tokio::test]
async fn test_partial_entries_are_reassembled() {
    let d = driver();
    let mut writer = d.start("fifo", d.info("a", &[])).await;
    writer.send(partial("stdout", 10, "hel", "p1", 1, false)).await.unwrap();
    writer.send(partial("stdout", 11, "lo ", "p1", 2, false)).await.unwrap();
    writer.send(partial("stdout", 12, "world", "p1", 3, true)).await.unwrap();
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let docs = d.finish().await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["message"], "hello world");
}

#[tokio::test]
async fn test_streams_reassemble_independently() {
    let d = driver();
    let mut writer = d.start("fifo", d.info("a", &[])).await;
    writer.send(partial("stdout", 10, "out-", "o", 1, false)).await.unwrap();
    writer.send(partial("stderr", 11, "err-", "e", 1, false)).await.unwrap();
    writer.send(partial("stdout", 12, "done", "o", 2, true)).await.unwrap();
    writer.send(partial("stderr", 13, "done", "e", 2, true)).await.unwrap();
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let docs = d.finish().await;
    let messages: Vec<(&str, &str)> = docs
        .iter()
        .map(|d| (d["log_source"].as_str().unwrap(), d["message"].as_str().unwrap()))
        .collect();
    assert_eq!(messages, vec![("stdout", "out-done"), ("stderr", "err-done")]);
}

#[tokio::test]
async fn test_stale_partial_flushed_by_sweep() {
    let d = driver();
    d.manager.start_sweep();
    let mut writer = d.start("fifo", d.info("a", &[])).await;
    writer.send(partial("stdout", 10, "never finished", "p", 1, false)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(d.senders.lock()[0].len(), 1);
    drop(writer);
    let docs = d.finish().await;
    assert_eq!(docs[0]["message"], "never finished");
}

// ── multiline ───────────────────────────────────────────────────

#[tokio::test]
async fn test_stack_trace_grouped() {
    let d = driver();
    let info = d.info("a", &[("logzio-multiline-pattern", r"^\s")]);
    let mut writer = d.start("fifo", info).await;
    for (i, line) in [
        "Exception in thread main",
        "  at com.acme.Foo(Foo.java:1)",
        "  at com.acme.Bar(Bar.java:2)",
        "next event",
    ]
    .iter()
    .enumerate()
    {
        writer.send(LogEntry::new("stderr", i as i64, *line)).await.unwrap();
    }
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let docs = d.finish().await;
    assert_eq!(docs.len(), 2);
    assert_eq!(
        docs[0]["message"],
        "Exception in thread main\n  at com.acme.Foo(Foo.java:1)\n  at com.acme.Bar(Bar.java:2)"
    );
    assert_eq!(docs[0]["lines"], 3);
    assert_eq!(docs[1]["message"], "next event");
}

#[tokio::test]
async fn test_multiline_timeout_flushes_open_event() {
    let d = driver();
    d.manager.start_sweep();
    let info = d.info(
        "a",
        &[
            ("logzio-multiline-pattern", r"^\s"),
            ("logzio-multiline-timeout", "100ms"),
        ],
    );
    let mut writer = d.start("fifo", info).await;
    writer.send(LogEntry::new("stderr", 1, "boom")).await.unwrap();
    writer.send(LogEntry::new("stderr", 2, "  at main")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(d.senders.lock()[0].len(), 1);
    drop(writer);
    let docs = d.finish().await;
    assert_eq!(docs[0]["message"], "boom\n  at main");
    assert_eq!(docs[0]["lines"], 2);
}

// ── read back ───────────────────────────────────────────────────

#[tokio::test]
async fn test_read_logs_honours_tail_and_skips_blank_sends() {
    let d = driver();
    let mut writer = d.start("fifo", d.info("a", &[])).await;
    writer.send(LogEntry::new("stdout", 1, "one")).await.unwrap();
    writer.send(LogEntry::new("stdout", 2, "   ")).await.unwrap();
    writer.send(LogEntry::new("stdout", 3, "three")).await.unwrap();
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let config = ReadConfig {
        tail: 2,
        ..ReadConfig::default()
    };
    let logs: Vec<String> = d
        .manager
        .read_logs("a", config)
        .unwrap()
        .map(|r| r.unwrap().log)
        .collect()
        .await;
    assert_eq!(logs, vec!["   ", "three"]);

    let docs = d.finish().await;
    let messages: Vec<&str> = docs.iter().map(|d| d["message"].as_str().unwrap()).collect();
    assert_eq!(messages, vec!["one", "three"]);
}

#[tokio::test]
async fn test_follow_sees_new_entries() {
    let d = driver();
    let mut writer = d.start("fifo", d.info("a", &[])).await;
    writer.send(LogEntry::new("stdout", 1, "old")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let config = ReadConfig {
        follow: true,
        ..ReadConfig::default()
    };
    let mut follow = Box::pin(d.manager.read_logs("a", config).unwrap());
    assert_eq!(follow.next().await.unwrap().unwrap().log, "old");

    writer.send(LogEntry::new("stdout", 2, "new")).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), follow.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(next.log, "new");

    drop(writer);
    d.manager.stop_logging("fifo").unwrap();
    d.manager.shutdown().await;
    let rest = tokio::time::timeout(Duration::from_secs(2), follow.next()).await.unwrap();
    assert!(rest.is_none());
}
