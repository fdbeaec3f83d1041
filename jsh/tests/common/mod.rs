#![allow(dead_code)]

use jsh::{
    Engine, EngineConfig, ExitStatus, Job, JobState, Process, ProcessState, ProcessStatus, Stream,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    IoClosed(Stream),
    State(JobState, Option<ExitStatus>),
    Process(ProcessStatus),
}

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn attach(job: &Job) -> Self {
        let recorder = Recorder::default();
        let sink = Arc::clone(&recorder.events);
        job.on_stdout(move |data| sink.lock().push(Event::Stdout(data.clone())));
        let sink = Arc::clone(&recorder.events);
        job.on_stderr(move |data| sink.lock().push(Event::Stderr(data.clone())));
        let sink = Arc::clone(&recorder.events);
        job.on_io_closed(move |stream| sink.lock().push(Event::IoClosed(*stream)));
        let sink = Arc::clone(&recorder.events);
        job.on_state_changed(move |status| {
            sink.lock()
                .push(Event::State(status.state, status.exit_status))
        });
        let sink = Arc::clone(&recorder.events);
        job.on_process_state_changed(move |status| sink.lock().push(Event::Process(*status)));
        recorder
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.collect(|event| match event {
            Event::Stdout(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.collect(|event| match event {
            Event::Stderr(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    fn collect<F>(&self, pick: F) -> Vec<u8>
    where
        F: Fn(&Event) -> Option<&[u8]>,
    {
        let events = self.events.lock();
        events.iter().filter_map(pick).flatten().copied().collect()
    }

    pub fn states(&self) -> Vec<JobState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::State(state, _) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn saw_state(&self, state: JobState) -> bool {
        self.states().contains(&state)
    }

    pub fn terminated(&self) -> Option<Option<ExitStatus>> {
        self.events.lock().iter().find_map(|event| match event {
            Event::State(JobState::Terminated, status) => Some(*status),
            _ => None,
        })
    }

    pub fn process_events(&self) -> Vec<ProcessStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Process(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn count_terminated(&self) -> usize {
        self.states()
            .into_iter()
            .filter(|state| *state == JobState::Terminated)
            .count()
    }
}

pub fn init() {
    let _ = tracing_subscriber::fmt::try_init();
}

pub fn engine() -> Engine {
    Engine::init(EngineConfig {
        interactive: Some(false),
        ..EngineConfig::default()
    })
    .unwrap()
}

pub fn cmd(program: &str) -> Process {
    Process::new(program).env("PATH", PATH)
}

pub fn sh(script: &str) -> Process {
    Process::new("/bin/sh").args(["-c", script]).env("PATH", PATH)
}

/// Run the engine's host loop until `done` holds, failing after ten seconds.
pub fn pump_until<F>(engine: &Engine, mut done: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for job events");
        engine.dispatch(Some(Duration::from_millis(50))).unwrap();
    }
}

pub fn wait_terminated(engine: &Engine, recorder: &Recorder) -> Option<ExitStatus> {
    pump_until(engine, || recorder.terminated().is_some());
    recorder.terminated().flatten()
}

pub fn all_terminated(job: &Job) -> bool {
    job.process_states()
        .iter()
        .all(|status| matches!(status.state, ProcessState::Terminated(_)))
}
