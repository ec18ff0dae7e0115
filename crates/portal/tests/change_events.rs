//! Change events to issue notes, against an in-memory feed and sink

use async_trait::async_trait;
use futures::StreamExt;
use portal::Error;
use portal::change_events::{
    ANNOTATION_ATTEMPTS, ANNOTATION_RETRY_DELAY, AnnotationSink, ChangeEventProcessor,
    EventFeed, EventSession, RECONNECT_DELAY,
};
use portal::gerrit::RedmineAnnotation;
use service_orchestration::health::testing::RecordingSleeper;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Serves the same lines on every session
struct StaticFeed {
    lines: Vec<String>,
}

#[async_trait]
impl EventFeed for StaticFeed {
    async fn open(&self) -> portal::Result<EventSession> {
        let lines = self.lines.clone().into_iter().map(Ok);
        Ok(EventSession {
            lines: futures::stream::iter(lines).boxed(),
            process: None,
        })
    }
}

/// Serves scripted sessions in order; once they run out it signals `idle`
/// and serves a session that never ends
struct ScriptedFeed {
    sessions: Mutex<VecDeque<portal::Result<Vec<String>>>>,
    opens: Mutex<u32>,
    idle: async_channel::Sender<()>,
}

impl ScriptedFeed {
    fn new(sessions: Vec<portal::Result<Vec<String>>>) -> (Arc<Self>, async_channel::Receiver<()>) {
        let (idle, idle_rx) = async_channel::unbounded();
        let feed = Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            opens: Mutex::new(0),
            idle,
        });
        (feed, idle_rx)
    }

    fn opens(&self) -> u32 {
        *self.opens.lock().unwrap()
    }
}

#[async_trait]
impl EventFeed for ScriptedFeed {
    async fn open(&self) -> portal::Result<EventSession> {
        *self.opens.lock().unwrap() += 1;
        let next = self.sessions.lock().unwrap().pop_front();
        let lines = match next {
            Some(Ok(lines)) => futures::stream::iter(lines.into_iter().map(Ok)).boxed(),
            Some(Err(e)) => return Err(e),
            None => {
                let _ = self.idle.try_send(());
                futures::stream::pending().boxed()
            }
        };
        Ok(EventSession {
            lines,
            process: None,
        })
    }
}

/// Records every attempt and answers from a script, then succeeds
#[derive(Default)]
struct ScriptedSink {
    attempts: Mutex<Vec<RedmineAnnotation>>,
    failures: Mutex<VecDeque<Error>>,
}

impl ScriptedSink {
    fn failing(failures: Vec<Error>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into()),
            ..Default::default()
        })
    }

    fn attempts(&self) -> Vec<RedmineAnnotation> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnnotationSink for ScriptedSink {
    async fn annotate(&self, annotation: &RedmineAnnotation) -> portal::Result<()> {
        self.attempts.lock().unwrap().push(annotation.clone());
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn event(kind: &str, message: &str) -> String {
    serde_json::json!({
        "type": kind,
        "change": {
            "project": "app",
            "url": "https://nsbox.local:8443/c/app/+/12",
            "commitMessage": message,
        },
        "eventCreatedOn": 1700000000,
    })
    .to_string()
}

fn processor(
    lines: Vec<String>,
    sink: &Arc<ScriptedSink>,
    sleeper: &Arc<RecordingSleeper>,
) -> ChangeEventProcessor {
    ChangeEventProcessor::new(Arc::new(StaticFeed { lines }), sink.clone())
        .with_sleeper(sleeper.clone())
}

#[smol_potat::test]
async fn test_each_bug_id_gets_a_note() {
    let sink = Arc::new(ScriptedSink::default());
    let sleeper = RecordingSleeper::new();
    let line = event(
        "patchset-created",
        "Fix login loop\n\nBug-Id: 42\nbug-id:   7\nChange-Id: I0123\n",
    );

    let delivered = processor(vec![], &sink, &sleeper).process_line(&line).await;

    assert_eq!(delivered, 2);
    let attempts = sink.attempts();
    let tickets: Vec<&str> = attempts.iter().map(|a| a.ticket.as_str()).collect();
    assert_eq!(tickets, vec!["42", "7"]);
    assert!(
        attempts[0]
            .note
            .starts_with("patchset-created https://nsbox.local:8443/c/app/+/12\n\n    Fix login loop\n")
    );
    assert!(attempts[0].note.contains("\n    Bug-Id: 42\n"));
}

#[smol_potat::test]
async fn test_no_marker_no_note() {
    let sink = Arc::new(ScriptedSink::default());
    let sleeper = RecordingSleeper::new();
    let line = event("change-merged", "Refactor parser\n\nSee Bug-Id: 42 inline\n");

    let delivered = processor(vec![], &sink, &sleeper).process_line(&line).await;

    assert_eq!(delivered, 0);
    assert!(sink.attempts().is_empty());
}

#[smol_potat::test]
async fn test_garbage_line_is_skipped() {
    let sink = Arc::new(ScriptedSink::default());
    let sleeper = RecordingSleeper::new();
    let lines = vec![
        "not json at all".to_string(),
        "{\"type\": 3}".to_string(),
        event("change-merged", "Add tests\n\nBug-Id: 9\n"),
    ];

    processor(lines, &sink, &sleeper).run_once().await.unwrap();

    let attempts = sink.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].ticket, "9");
}

#[smol_potat::test]
async fn test_transport_errors_are_retried() {
    let sink = ScriptedSink::failing(vec![
        Error::Transport("connection reset".to_string()),
        Error::Transport("connection reset".to_string()),
    ]);
    let sleeper = RecordingSleeper::new();
    let line = event("patchset-created", "Bug-Id: 5\n");

    let delivered = processor(vec![], &sink, &sleeper).process_line(&line).await;

    assert_eq!(delivered, 1);
    assert_eq!(sink.attempts().len(), 3);
    assert_eq!(sleeper.sleeps(), vec![ANNOTATION_RETRY_DELAY; 2]);
}

#[smol_potat::test]
async fn test_retries_are_bounded() {
    let sink = ScriptedSink::failing(
        (0..5)
            .map(|_| Error::Transport("timed out".to_string()))
            .collect(),
    );
    let sleeper = RecordingSleeper::new();
    let line = event("patchset-created", "Bug-Id: 5\n");

    let delivered = processor(vec![], &sink, &sleeper).process_line(&line).await;

    assert_eq!(delivered, 0);
    assert_eq!(sink.attempts().len(), ANNOTATION_ATTEMPTS as usize);
}

#[smol_potat::test]
async fn test_http_errors_are_not_retried() {
    let sink = ScriptedSink::failing(vec![Error::Http {
        status: 404,
        body: "issue not found".to_string(),
    }]);
    let sleeper = RecordingSleeper::new();
    let line = event("patchset-created", "Bug-Id: 404\nBug-Id: 5\n");

    let delivered = processor(vec![], &sink, &sleeper).process_line(&line).await;

    assert_eq!(delivered, 1);
    assert_eq!(sink.attempts().len(), 2);
    assert!(sleeper.sleeps().is_empty());
}

#[smol_potat::test]
async fn test_reconnects_after_open_failure_and_end_of_stream() {
    let (feed, idle) = ScriptedFeed::new(vec![
        Err(Error::Transport("connection refused".to_string())),
        Ok(vec![event("change-merged", "Bug-Id: 11\n")]),
        Ok(vec![event("patchset-created", "Bug-Id: 12\n")]),
    ]);
    let sink = Arc::new(ScriptedSink::default());
    let sleeper = RecordingSleeper::new();
    let processor = ChangeEventProcessor::new(feed.clone(), sink.clone()).with_sleeper(sleeper.clone());

    smol::future::or(
        async {
            let _ = processor.run().await;
        },
        async {
            let _ = idle.recv().await;
        },
    )
    .await;

    assert_eq!(feed.opens(), 4);
    assert_eq!(sleeper.sleeps(), vec![RECONNECT_DELAY; 4]);
    let tickets: Vec<String> = sink.attempts().into_iter().map(|a| a.ticket).collect();
    assert_eq!(tickets, vec!["11", "12"]);
}
