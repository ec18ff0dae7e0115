//! In-crate fakes for unit tests

use async_trait::async_trait;
use command_executor::launcher::LineStream;
use command_executor::{
    Command, Error as ExecError, ExitResult, ExitStatus, Launcher, OutputRelay, ProcessHandle,
    Result as ExecResult, Signal,
};
use futures::StreamExt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

/// A process that has already exited
pub struct ExitedHandle {
    status: ExitStatus,
}

impl ExitedHandle {
    pub fn new(code: i32) -> Self {
        Self {
            status: ExitStatus {
                code: Some(code),
                signal: None,
            },
        }
    }
}

#[async_trait]
impl ProcessHandle for ExitedHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn signal(&mut self, _signal: Signal) -> ExecResult<()> {
        Err(ExecError::NotRunning)
    }

    async fn wait(&mut self) -> ExecResult<ExitStatus> {
        Ok(self.status)
    }

    fn try_status(&mut self) -> ExecResult<Option<ExitStatus>> {
        Ok(Some(self.status))
    }
}

#[derive(Default)]
struct Script {
    commands: Vec<String>,
    failures: Vec<String>,
    outputs: Vec<(String, String)>,
    lines: Vec<String>,
}

/// Records every command and answers from a script
///
/// A command fails when its command line contains a registered failure
/// pattern; otherwise it succeeds with the first matching canned output.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(self, pattern: &str) -> Self {
        self.script.lock().unwrap().failures.push(pattern.to_string());
        self
    }

    pub fn output_for(self, pattern: &str, output: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .outputs
            .push((pattern.to_string(), output.to_string()));
        self
    }

    pub fn with_lines(self, lines: &[&str]) -> Self {
        self.script.lock().unwrap().lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.script.lock().unwrap().commands.clone()
    }

    fn answer(&self, command: &Command) -> (i32, String) {
        let line = command.to_string();
        let mut script = self.script.lock().unwrap();
        script.commands.push(line.clone());
        if script.failures.iter().any(|p| line.contains(p.as_str())) {
            return (1, format!("{} failed", line));
        }
        let output = script
            .outputs
            .iter()
            .find(|(p, _)| line.contains(p.as_str()))
            .map(|(_, o)| o.clone())
            .unwrap_or_default();
        (0, output)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(
        &self,
        command: Command,
        _relay: OutputRelay,
    ) -> ExecResult<Box<dyn ProcessHandle>> {
        let (code, _) = self.answer(&command);
        Ok(Box::new(ExitedHandle::new(code)))
    }

    async fn output(&self, command: Command) -> ExecResult<ExitResult> {
        let (code, output) = self.answer(&command);
        Ok(ExitResult {
            status: ExitStatus {
                code: Some(code),
                signal: None,
            },
            output,
        })
    }

    async fn stream_lines(
        &self,
        command: Command,
        _stderr: OutputRelay,
    ) -> ExecResult<(Box<dyn ProcessHandle>, LineStream)> {
        let (code, _) = self.answer(&command);
        let lines = self.script.lock().unwrap().lines.clone();
        let stream: LineStream = futures::stream::iter(lines.into_iter().map(Ok)).boxed();
        Ok((Box::new(ExitedHandle::new(code)), stream))
    }
}

/// Local HTTP server answering every request with one canned response
pub struct CannedServer {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedServer {
    pub fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let response = format!(
            "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                if let Some(request_line) = read_request(&stream) {
                    seen.lock().unwrap().push(request_line);
                }
                let _ = (&stream).write_all(response.as_bytes());
            }
        });
        Self { url, requests }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request lines received so far, e.g. `PUT /my/account.json HTTP/1.1`
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Consume one request and return its request line
fn read_request(stream: &TcpStream) -> Option<String> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut length = 0;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).ok()? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body).ok()?;
    Some(request_line.trim_end().to_string())
}
