mod common;

use common::{Event, Recorder, all_terminated, cmd, engine, init, pump_until, sh, wait_terminated};
use jsh::{
    ExitStatus, JobState, JshError, Mode, ProcessState, Redirect, Stream, StreamMask,
};
use nix::sys::signal::Signal;

#[test]
fn printf_into_cat_orders_events() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("printf").arg("a")).unwrap();
    job.add(cmd("cat")).unwrap();
    assert_eq!(job.command(), "printf a | cat");
    let recorder = Recorder::attach(&job);

    job.start(Mode::Foreground, StreamMask::STDOUT).unwrap();
    assert_eq!(engine.jobs().len(), 1);
    assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(0)));

    let observed: Vec<Event> = recorder
        .events()
        .into_iter()
        .filter(|event| {
            !matches!(
                event,
                Event::Process(_) | Event::State(JobState::Running, _)
            )
        })
        .collect();
    assert_eq!(
        observed,
        vec![
            Event::Stdout(b"a".to_vec()),
            Event::IoClosed(Stream::Stdout),
            Event::State(JobState::Terminated, Some(ExitStatus::Exited(0))),
        ]
    );
    assert!(job.is_terminated());
    assert!(job.is_io_closed());
    assert!(engine.jobs().is_empty());
    assert_eq!(job.exit_status(), Some(ExitStatus::Exited(0)));
    engine.deinit();
}

#[test]
fn stdin_writes_arrive_in_order_then_eof() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("cat")).unwrap();
    let recorder = Recorder::attach(&job);

    job.start(Mode::Foreground, StreamMask::STDIN | StreamMask::STDOUT)
        .unwrap();
    job.write("hello ");
    job.write(b"world".to_vec());
    job.close();
    // ignored after close
    job.write("late");

    assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(0)));
    assert_eq!(recorder.stdout(), b"hello world");
    engine.deinit();
}

#[test]
fn writes_before_start_are_delivered() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("cat")).unwrap();
    let recorder = Recorder::attach(&job);
    job.write("early");
    job.close();

    job.start(Mode::Background, StreamMask::STDIN | StreamMask::STDOUT)
        .unwrap();
    wait_terminated(&engine, &recorder);
    assert_eq!(recorder.stdout(), b"early");
    engine.deinit();
}

#[test]
fn large_input_survives_partial_writes() {
    init();
    let engine = jsh::Engine::init(jsh::EngineConfig {
        interactive: Some(false),
        write_chunk_size: 4096,
        read_buffer_size: 1000,
        ..jsh::EngineConfig::default()
    })
    .unwrap();
    let job = engine.create_job();
    job.add(cmd("cat")).unwrap();
    job.add(cmd("cat")).unwrap();
    let recorder = Recorder::attach(&job);

    let input: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    job.start(Mode::Foreground, StreamMask::STDIN | StreamMask::STDOUT)
        .unwrap();
    for chunk in input.chunks(100_000) {
        job.write(chunk);
    }
    job.close();

    assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(0)));
    let output = recorder.stdout();
    assert_eq!(output.len(), input.len());
    assert!(output == input, "pipeline output differs from input");
    engine.deinit();
}

#[test]
fn every_stage_runs_before_any_terminates() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("printf").arg("x")).unwrap();
    job.add(cmd("cat")).unwrap();
    job.add(cmd("cat")).unwrap();
    let recorder = Recorder::attach(&job);

    job.start(Mode::Foreground, StreamMask::STDOUT).unwrap();
    wait_terminated(&engine, &recorder);

    let pids = job.pids();
    assert_eq!(pids.len(), 3);
    assert!(pids[0] != pids[1] && pids[1] != pids[2] && pids[0] != pids[2]);
    assert_eq!(job.pgid(), None);

    let events = recorder.process_events();
    let last_running = events
        .iter()
        .rposition(|s| s.state == ProcessState::Running)
        .unwrap();
    let first_terminated = events
        .iter()
        .position(|s| s.state.is_terminated())
        .unwrap();
    assert!(last_running < first_terminated);
    for index in 0..3 {
        assert!(
            events
                .iter()
                .any(|s| s.index == index && s.state == ProcessState::Running)
        );
    }
    assert_eq!(recorder.stdout(), b"x");
    engine.deinit();
}

#[test]
fn terminate_stops_every_stage_once() {
    init();
    let engine = engine();
    let job = engine.create_job();
    for _ in 0..3 {
        job.add(cmd("sleep").arg("30")).unwrap();
    }
    let recorder = Recorder::attach(&job);

    job.start(Mode::Background, StreamMask::STDOUT).unwrap();
    job.terminate();

    assert_eq!(
        wait_terminated(&engine, &recorder),
        Some(ExitStatus::Signaled(Signal::SIGTERM, false))
    );
    assert!(all_terminated(&job));
    // a second terminate is a no-op
    job.terminate();
    engine.dispatch(Some(std::time::Duration::from_millis(100))).unwrap();
    assert_eq!(recorder.count_terminated(), 1);
    engine.deinit();
}

#[test]
fn stderr_collects_every_stage() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(sh("echo one >&2; echo data")).unwrap();
    job.add(sh("cat; echo two >&2")).unwrap();
    let recorder = Recorder::attach(&job);

    job.start(Mode::Foreground, StreamMask::STDOUT | StreamMask::STDERR)
        .unwrap();
    wait_terminated(&engine, &recorder);

    let stderr = String::from_utf8(recorder.stderr()).unwrap();
    assert!(stderr.contains("one"));
    assert!(stderr.contains("two"));
    assert_eq!(recorder.stdout(), b"data\n");

    let events = recorder.events();
    let closed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::IoClosed(_)))
        .map(|(i, _)| i)
        .collect();
    let terminated = events
        .iter()
        .position(|e| matches!(e, Event::State(JobState::Terminated, _)))
        .unwrap();
    assert_eq!(closed.len(), 2);
    assert!(closed.iter().all(|i| *i < terminated));
    engine.deinit();
}

#[test]
fn exit_status_comes_from_last_stage() {
    init();
    let engine = engine();

    let job = engine.create_job();
    job.add(cmd("true")).unwrap();
    job.add(sh("exit 3")).unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Foreground, StreamMask::NONE).unwrap();
    assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(3)));

    let job = engine.create_job();
    job.add(sh("exit 3")).unwrap();
    job.add(cmd("true")).unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Foreground, StreamMask::NONE).unwrap();
    assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(0)));
    engine.deinit();
}

#[test]
fn missing_program_exits_127() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("jsh-definitely-not-a-program")).unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Foreground, StreamMask::STDOUT | StreamMask::STDERR)
        .unwrap();
    let status = wait_terminated(&engine, &recorder);
    assert_eq!(status, Some(ExitStatus::Exited(jsh::EXEC_FAILED)));
    assert_eq!(status.map(|s| s.code()), Some(127));
    engine.deinit();
}

#[test]
fn redirects_are_applied_in_the_child() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let engine = engine();

    for (text, append) in [("first\n", false), ("second\n", true)] {
        let job = engine.create_job();
        job.add(
            cmd("printf")
                .arg(text)
                .redirect(Redirect::file(1, &path, append)),
        )
        .unwrap();
        let recorder = Recorder::attach(&job);
        job.start(Mode::Foreground, StreamMask::NONE).unwrap();
        assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(0)));
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

    let job = engine.create_job();
    job.add(
        sh("echo to-stderr >&2")
            .redirect(Redirect::duplicate(2, 1)),
    )
    .unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Foreground, StreamMask::STDOUT | StreamMask::STDERR)
        .unwrap();
    wait_terminated(&engine, &recorder);
    assert_eq!(recorder.stdout(), b"to-stderr\n");
    assert!(recorder.stderr().is_empty());
    engine.deinit();
}

#[test]
fn early_exit_of_reader_closes_stdin() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(sh("exit 0")).unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Foreground, StreamMask::STDIN | StreamMask::STDOUT)
        .unwrap();
    job.write(vec![b'z'; 512 * 1024]);
    job.close();
    assert_eq!(wait_terminated(&engine, &recorder), Some(ExitStatus::Exited(0)));
    engine.deinit();
}

#[test]
fn live_registry_keeps_dropped_handles_running() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("printf").arg("kept")).unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Background, StreamMask::STDOUT).unwrap();
    let id = job.id().to_string();
    drop(job);

    assert!(engine.find_job(&id).is_some());
    wait_terminated(&engine, &recorder);
    assert_eq!(recorder.stdout(), b"kept");
    assert!(engine.find_job(&id).is_none());
    engine.deinit();
}

#[test]
fn misuse_is_reported() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("true")).unwrap();
    let recorder = Recorder::attach(&job);
    job.start(Mode::Foreground, StreamMask::NONE).unwrap();

    let err = job.add(cmd("false")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JshError>(),
        Some(JshError::AlreadyStarted { .. })
    ));
    let err = job.start(Mode::Foreground, StreamMask::NONE).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<JshError>(),
        Some(JshError::AlreadyStarted { .. })
    ));
    wait_terminated(&engine, &recorder);
    assert_eq!(job.command(), "true");
    engine.deinit();
}

#[test]
fn unsubscribed_callbacks_stay_silent() {
    init();
    let engine = engine();
    let job = engine.create_job();
    job.add(cmd("printf").arg("abc")).unwrap();
    let recorder = Recorder::attach(&job);
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&calls);
    let key = job.on_stdout(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    assert!(job.events().stdout.unsubscribe(key));

    job.start(Mode::Foreground, StreamMask::STDOUT).unwrap();
    pump_until(&engine, || recorder.terminated().is_some());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(recorder.stdout(), b"abc");
    engine.deinit();
}
