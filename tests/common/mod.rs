//! Fake spectrometer server for integration tests.
#![allow(dead_code)]

use spectro_daq::channel::{RetryPolicy, Timing};
use spectro_daq::config::Settings;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Pause between chunks of a multi-part reply; well below the idle timeout.
pub const CHUNK_GAP: Duration = Duration::from_millis(10);

pub const SPECTRUM_HEAD: &str = "OK\nWavelength Intensity\n1000.0 5.0\n";
pub const SPECTRUM_TAIL: &str = "1500.0 4.0\nbad row\n2000.0 3.0\n";

#[derive(Default)]
struct State {
    script: HashMap<String, VecDeque<Vec<String>>>,
    received: Vec<String>,
    connections: usize,
}

/// Line-oriented TCP server answering commands from a script.
///
/// Unknown commands get no reply at all, like the real server.
pub struct FakeInstrument {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl FakeInstrument {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                shared.lock().unwrap().connections += 1;
                tokio::spawn(serve(socket, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    /// A server that completes a 3-point acquisition with default settings.
    pub async fn healthy() -> Self {
        let fake = Self::start().await;
        fake.respond("*IDN?", "OK\nARCspectro FTIR 1.4");
        fake.respond("STAT:INIT?", "STAT:INIT?\nOK\n\n0");
        for command in [
            "TRAN:LEN 1",
            "TRAN:BIN 0",
            "TRAN:SABS 1",
            "SPEC:WLG 1",
            "GAIN:SET 0",
            "SPEC:APO 3",
            "SPEC:AVG 5",
            "SPEC:GET?",
        ] {
            fake.respond(command, "OK");
        }
        fake.respond_sequence("MEAS:REM?", ["OK\n\n2", "OK\n\n0"]);
        fake.respond("SPEC:SAT?", "OK\n\n0.35");
        fake.respond_chunks("TRAN:SPEC?", [SPECTRUM_HEAD, SPECTRUM_TAIL]);
        fake
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn respond(&self, command: &str, response: &str) {
        self.respond_chunks(command, [response]);
    }

    /// Reply with `chunks` written separately, [`CHUNK_GAP`] apart.
    pub fn respond_chunks<const N: usize>(&self, command: &str, chunks: [&str; N]) {
        let reply: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
        self.state
            .lock()
            .unwrap()
            .script
            .insert(command.to_string(), VecDeque::from([reply]));
    }

    /// Successive replies; the last one repeats.
    pub fn respond_sequence<const N: usize>(&self, command: &str, responses: [&str; N]) {
        let replies: VecDeque<Vec<String>> =
            responses.iter().map(|r| vec![r.to_string()]).collect();
        self.state
            .lock()
            .unwrap()
            .script
            .insert(command.to_string(), replies);
    }

    /// Every command line received, across all connections.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }
}

impl Drop for FakeInstrument {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, state: Arc<Mutex<State>>) {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        let reply = {
            let mut state = state.lock().unwrap();
            state.received.push(command.clone());
            state.script.get_mut(&command).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };

        let Some(chunks) = reply else { continue };
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(CHUNK_GAP).await;
            }
            if writer.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Command timing short enough for tests but well above the chunk gap.
pub fn fast_timing() -> Timing {
    Timing {
        response_timeout: Duration::from_millis(50),
        post_send_delay: Duration::from_millis(5),
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        backoff_delay: Duration::from_millis(5),
        ..RetryPolicy::default()
    }
}

/// Settings pointing at `fake` with test timings and output under `dir`.
pub fn settings_for(fake: &FakeInstrument, dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.application.output_dir = dir.join("spectra");
    settings.instrument.port = fake.port();
    settings.instrument.connect_timeout_ms = 1_000;
    settings.instrument.command_delay_ms = 5;
    settings.instrument.response_timeout_ms = 50;
    settings.instrument.spectrum_timeout_ms = 50;
    settings.instrument.retry_attempts = 2;
    settings.instrument.retry_delay_ms = 5;
    settings.readiness.max_wait_ms = 2_000;
    settings.readiness.poll_interval_ms = 10;
    settings.readiness.connect_timeout_ms = 500;
    settings.acquisition.poll_interval_ms = 5;
    settings.acquisition.max_polls = Some(20);
    settings
}
