//! End-to-end scheduler scenarios: graph ordering, machine transitions,
//! task promises, per-worker batches, and shutdown boundary behavior.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use trellis::{Batch, Registry, Scheduler, SchedulerConfig, TaskPromise};

fn config(max_workers: usize) -> SchedulerConfig {
    SchedulerConfig { max_workers }
}

#[test]
fn linear_chain_executes_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut reg = Registry::new();
    let m = reg.machine();
    let s = reg.stage();

    let o = Arc::clone(&order);
    let f1 = reg.add_func(s, move || o.lock().unwrap().push(1), &[]).unwrap();
    let o = Arc::clone(&order);
    let f2 = reg
        .add_func(s, move || o.lock().unwrap().push(2), &[f1])
        .unwrap();
    let o = Arc::clone(&order);
    reg.add_func(
        s,
        move || {
            o.lock().unwrap().push(3);
            trellis::request_shutdown();
        },
        &[f2],
    )
    .unwrap();

    reg.add_stage(m, s, &[]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(report.funcs_executed, 3);
    assert_eq!(report.machine_runs, 1);
}

#[test]
fn diamond_runs_tip_first_and_tail_last() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut reg = Registry::new();
    let m = reg.machine();
    let s = reg.stage();

    let push = |order: &Arc<Mutex<Vec<char>>>, c: char| {
        let order = Arc::clone(order);
        move || order.lock().unwrap().push(c)
    };

    let a = reg.add_func(s, push(&order, 'a'), &[]).unwrap();
    let b = reg.add_func(s, push(&order, 'b'), &[a]).unwrap();
    let c = reg.add_func(s, push(&order, 'c'), &[a]).unwrap();
    let o = Arc::clone(&order);
    reg.add_func(
        s,
        move || {
            o.lock().unwrap().push('d');
            trellis::request_shutdown();
        },
        &[b, c],
    )
    .unwrap();

    reg.add_stage(m, s, &[]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], 'a');
    assert_eq!(order[3], 'd');
    assert!(order[1..3].contains(&'b'));
    assert!(order[1..3].contains(&'c'));
    assert_eq!(report.funcs_executed, 4);
}

#[test]
fn stage_dependency_orders_functions_across_stages() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut reg = Registry::new();
    let m = reg.machine();
    let s1 = reg.stage();
    let s2 = reg.stage();

    let o = Arc::clone(&order);
    reg.add_func(s1, move || o.lock().unwrap().push("f"), &[])
        .unwrap();
    let o = Arc::clone(&order);
    reg.add_func(
        s2,
        move || {
            o.lock().unwrap().push("g");
            trellis::request_shutdown();
        },
        &[],
    )
    .unwrap();

    let l1 = reg.add_stage(m, s1, &[]).unwrap();
    reg.add_stage(m, s2, &[l1]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(*order.lock().unwrap(), vec!["f", "g"]);
    assert_eq!(report.machine_runs, 1);
}

#[test]
fn task_promise_delivers_argument_and_completion() {
    // Workers exist from construction; no machine run is needed for tasks.
    let mut reg = Registry::new();
    let m = reg.machine();
    reg.set_default_machine(m).unwrap();
    let sched = Scheduler::new(reg.freeze().unwrap(), config(2));

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let p = sched.handle().issue_task(
        move |arg| {
            let v = *arg.downcast::<i32>().unwrap();
            assert_eq!(v, 42);
            gate_rx.recv().unwrap();
        },
        Box::new(42i32),
    );

    // Copy made before completion observes the same state.
    let q = p.clone();
    assert!(!q.completed());

    let joiner = {
        let p = p.clone();
        thread::spawn(move || p.join())
    };
    gate_tx.send(()).unwrap();
    joiner.join().unwrap();

    assert!(p.completed());
    assert!(q.completed());
    assert!(!p.failed());
    drop(p);
    drop(q);
}

#[test]
fn machine_transition_runs_each_machine_once() {
    let m1_runs = Arc::new(AtomicU64::new(0));
    let m2_runs = Arc::new(AtomicU64::new(0));

    let mut reg = Registry::new();
    let m1 = reg.machine();
    let m2 = reg.machine();
    let s1 = reg.stage();
    let s2 = reg.stage();

    let count = Arc::clone(&m1_runs);
    reg.add_func(
        s1,
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            trellis::set_next_machine(m2);
        },
        &[],
    )
    .unwrap();
    let count = Arc::clone(&m2_runs);
    reg.add_func(
        s2,
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            trellis::request_shutdown();
        },
        &[],
    )
    .unwrap();

    reg.add_stage(m1, s1, &[]).unwrap();
    reg.add_stage(m2, s2, &[]).unwrap();
    reg.set_default_machine(m1).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(m1_runs.load(Ordering::SeqCst), 1);
    assert_eq!(m2_runs.load(Ordering::SeqCst), 1);
    assert_eq!(report.machine_runs, 2);
}

#[test]
fn per_worker_batch_sums_to_function_runs() {
    const FUNCS: u64 = 16;

    let mut reg = Registry::new();
    let m = reg.machine();
    let s = reg.stage();
    let batch = Arc::new(Batch::<u64>::new(2));
    let done = Arc::new(AtomicU64::new(0));

    for _ in 0..FUNCS {
        let batch = Arc::clone(&batch);
        let done = Arc::clone(&done);
        reg.add_func(
            s,
            move || {
                batch.with_local(|count| *count += 1);
                if done.fetch_add(1, Ordering::SeqCst) + 1 == FUNCS {
                    trellis::request_shutdown();
                }
            },
            &[],
        )
        .unwrap();
    }

    reg.add_stage(m, s, &[]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(report.funcs_executed, FUNCS);

    let batch = Arc::try_unwrap(batch)
        .ok()
        .expect("all worker references released after run");
    let total: u64 = batch.into_inner().into_iter().sum();
    assert_eq!(total, FUNCS);
}

#[test]
fn machine_with_no_stages_drains_and_rerunning_terminates() {
    let mut reg = Registry::new();
    let m = reg.machine();
    reg.set_default_machine(m).unwrap();

    let sched = Scheduler::new(reg.freeze().unwrap(), config(2));
    let handle = sched.handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.request_shutdown();
    });

    let report = sched.run();
    stopper.join().unwrap();

    // An empty machine drains instantly, so plenty of re-runs fit in the
    // window before shutdown.
    assert!(report.machine_runs >= 1);
    assert_eq!(report.funcs_executed, 0);
}

#[test]
fn empty_stage_is_transparent_between_stages() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut reg = Registry::new();
    let m = reg.machine();
    let first = reg.stage();
    let hollow = reg.stage();
    let last = reg.stage();

    let o = Arc::clone(&order);
    reg.add_func(first, move || o.lock().unwrap().push("first"), &[])
        .unwrap();
    let o = Arc::clone(&order);
    reg.add_func(
        last,
        move || {
            o.lock().unwrap().push("last");
            trellis::request_shutdown();
        },
        &[],
    )
    .unwrap();

    let l1 = reg.add_stage(m, first, &[]).unwrap();
    let l2 = reg.add_stage(m, hollow, &[l1]).unwrap();
    reg.add_stage(m, last, &[l2]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(*order.lock().unwrap(), vec!["first", "last"]);
    assert_eq!(report.machine_runs, 1);
}

#[test]
fn tasks_issued_inside_and_outside_workers_behave_identically() {
    let outer: Arc<Mutex<Option<TaskPromise>>> = Arc::new(Mutex::new(None));
    let inner: Arc<Mutex<Option<TaskPromise>>> = Arc::new(Mutex::new(None));
    let issued = Arc::new(AtomicBool::new(false));

    let mut reg = Registry::new();
    let m = reg.machine();
    let s = reg.stage();

    let inner_slot = Arc::clone(&inner);
    let outer_slot = Arc::clone(&outer);
    let issued_flag = Arc::clone(&issued);
    reg.add_func(
        s,
        move || {
            if !issued_flag.swap(true, Ordering::SeqCst) {
                // In-worker issue path.
                let p = trellis::issue_task(
                    |arg| {
                        assert_eq!(*arg.downcast::<i32>().unwrap(), 5);
                    },
                    Box::new(5i32),
                );
                *inner_slot.lock().unwrap() = Some(p);
                return;
            }
            // The machine re-runs until both tasks completed.
            let inner_done = inner_slot
                .lock()
                .unwrap()
                .as_ref()
                .map(TaskPromise::completed)
                .unwrap_or(false);
            let outer_done = outer_slot
                .lock()
                .unwrap()
                .as_ref()
                .map(TaskPromise::completed)
                .unwrap_or(false);
            if inner_done && outer_done {
                trellis::request_shutdown();
            }
        },
        &[],
    )
    .unwrap();

    reg.add_stage(m, s, &[]).unwrap();
    reg.set_default_machine(m).unwrap();

    let sched = Scheduler::new(reg.freeze().unwrap(), config(2));
    // External issue path, before the run loop starts.
    *outer.lock().unwrap() = Some(sched.handle().issue_task(
        |arg| {
            assert_eq!(*arg.downcast::<i32>().unwrap(), 5);
        },
        Box::new(5i32),
    ));

    let report = sched.run();
    assert!(outer.lock().unwrap().as_ref().unwrap().completed());
    assert!(inner.lock().unwrap().as_ref().unwrap().completed());
    assert!(!outer.lock().unwrap().as_ref().unwrap().failed());
    assert!(!inner.lock().unwrap().as_ref().unwrap().failed());
    assert_eq!(report.tasks_executed, 2);
    assert_eq!(report.tasks_dropped_at_shutdown, 0);
}

#[test]
fn shutdown_during_a_run_finishes_the_machine_first() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut reg = Registry::new();
    let m = reg.machine();
    let s = reg.stage();

    let o = Arc::clone(&order);
    let f1 = reg
        .add_func(
            s,
            move || {
                o.lock().unwrap().push(1);
                // Effective only at the machine boundary.
                trellis::request_shutdown();
            },
            &[],
        )
        .unwrap();
    let o = Arc::clone(&order);
    reg.add_func(s, move || o.lock().unwrap().push(2), &[f1])
        .unwrap();

    reg.add_stage(m, s, &[]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert_eq!(report.machine_runs, 1);
    assert_eq!(report.funcs_executed, 2);
}

#[test]
fn rerunning_a_machine_executes_each_function_once_per_run() {
    let runs = Arc::new(AtomicU64::new(0));
    let mut reg = Registry::new();
    let m = reg.machine();
    let s = reg.stage();

    let count = Arc::clone(&runs);
    reg.add_func(
        s,
        move || {
            // The queued machine is left unchanged, so the machine re-runs;
            // stop after the second pass.
            if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                trellis::request_shutdown();
            }
        },
        &[],
    )
    .unwrap();

    reg.add_stage(m, s, &[]).unwrap();
    reg.set_default_machine(m).unwrap();

    let report = Scheduler::new(reg.freeze().unwrap(), config(2)).run();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(report.machine_runs, 2);
    assert_eq!(report.funcs_executed, 2);
}

#[test]
fn tasks_left_in_the_queue_at_shutdown_are_orphaned() {
    let mut reg = Registry::new();
    let m = reg.machine();
    reg.set_default_machine(m).unwrap();

    // One worker: the first task occupies it, the second stays queued.
    let sched = Scheduler::new(reg.freeze().unwrap(), config(1));
    let handle = sched.handle();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let first = handle.issue_task(
        move |_| {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        },
        Box::new(()),
    );
    // Wait until the only worker is inside the first task, so the second
    // one is guaranteed to still be queued at shutdown.
    started_rx.recv().unwrap();
    let second = handle.issue_task(|_| {}, Box::new(()));

    handle.request_shutdown();
    let runner = thread::spawn(move || sched.run());

    // Let the runner reach termination and drop the queued task, then
    // release the in-flight one.
    thread::sleep(Duration::from_millis(200));
    gate_tx.send(()).unwrap();

    let report = runner.join().unwrap();
    assert!(first.completed(), "in-flight task runs to completion");
    assert!(!second.completed(), "queued task was dropped");
    assert_eq!(report.tasks_dropped_at_shutdown, 1);
    assert_eq!(report.tasks_executed, 1);
}
