use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft::{derive, provide, ControllerEvent, EntryState, Scope, ScopeOptions, WeftError};

#[tokio::test]
async fn test_invalidating_root_updates_derived_sum() {
    let a = provide("a", |_| async { Ok(2_i32) });
    let b = provide("b", |_| async { Ok(3_i32) });
    let sum = derive("sum", (a.clone(), b), |(x, y), _| async move { Ok(*x + *y) });
    let scope = Scope::new(ScopeOptions::new());

    assert_eq!(*scope.resolve(&sum).await.unwrap(), 5);

    scope.controller(&a).unwrap().set(10).unwrap();
    scope.flush().await.unwrap();

    assert_eq!(*scope.resolve(&sum).await.unwrap(), 13);
    assert_eq!(scope.state_of(&sum), EntryState::Resolved);
}

#[tokio::test]
async fn test_invalidate_only_enqueues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let clock = provide("clock", move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(n) }
    });
    let scope = Scope::new(ScopeOptions::new());

    assert_eq!(*scope.resolve(&clock).await.unwrap(), 0);
    scope.invalidate(&clock).unwrap();
    scope.invalidate(&clock).unwrap();
    scope.flush().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*scope.resolve(&clock).await.unwrap(), 1);
}

#[tokio::test]
async fn test_cleanups_run_in_reverse_before_resolving() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let factory_log = log.clone();
    let conn = provide("conn", move |ctx| {
        factory_log.lock().unwrap().push("factory".into());
        for name in ["c1", "c2", "c3"] {
            let log = factory_log.clone();
            ctx.cleanup(move || async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            });
        }
        async { Ok(()) }
    });
    let scope = Scope::new(ScopeOptions::new());

    let listener_log = log.clone();
    scope
        .controller(&conn)
        .unwrap()
        .on_change(move |event| {
            if matches!(event, ControllerEvent::Resolving) {
                listener_log.lock().unwrap().push("resolving".into());
            }
        })
        .unwrap();

    scope.resolve(&conn).await.unwrap();
    log.lock().unwrap().clear();

    scope.invalidate(&conn).unwrap();
    scope.flush().await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["c3", "c2", "c1", "resolving", "factory"]
    );
}

#[tokio::test]
async fn test_listener_loop_is_detected_and_scope_recovers() {
    let a = provide("alpha", |_| async { Ok(1_u8) });
    let b = provide("beta", |_| async { Ok(2_u8) });
    let unrelated = provide("gamma", |_| async { Ok(3_u8) });
    let scope = Scope::new(ScopeOptions::new());

    scope.resolve(&a).await.unwrap();
    scope.resolve(&b).await.unwrap();
    scope.resolve(&unrelated).await.unwrap();

    let ctl_a = scope.controller(&a).unwrap();
    let ctl_b = scope.controller(&b).unwrap();
    {
        let ctl_b = ctl_b.clone();
        ctl_a
            .on_change(move |event| {
                if matches!(event, ControllerEvent::Resolved) {
                    let _ = ctl_b.invalidate();
                }
            })
            .unwrap();
    }
    {
        let ctl_a = ctl_a.clone();
        ctl_b
            .on_change(move |event| {
                if matches!(event, ControllerEvent::Resolved) {
                    let _ = ctl_a.invalidate();
                }
            })
            .unwrap();
    }

    ctl_a.invalidate().unwrap();
    let err = scope.flush().await.unwrap_err();
    match &err {
        WeftError::InvalidationLoop { cycle } => {
            assert_eq!(cycle, &vec!["alpha".to_string(), "beta".to_string(), "alpha".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("alpha -> beta -> alpha"));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let gamma_ctl = scope.controller(&unrelated).unwrap();
    gamma_ctl
        .on_change(move |event| {
            if matches!(event, ControllerEvent::Resolved) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    gamma_ctl.set(30).unwrap();
    scope.flush().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*scope.resolve(&unrelated).await.unwrap(), 30);
}

#[tokio::test]
async fn test_loop_still_refreshes_dependents_off_the_cycle() {
    let counter = Arc::new(AtomicUsize::new(0));
    let a = provide("alpha", |_| async { Ok(1_u8) });
    let b = provide("beta", move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(n) }
    });
    let view = derive("beta-view", b.clone(), |n, _| async move { Ok(*n * 10) });
    let scope = Scope::new(ScopeOptions::new());

    scope.resolve(&a).await.unwrap();
    assert_eq!(*scope.resolve(&view).await.unwrap(), 0);

    let ctl_a = scope.controller(&a).unwrap();
    let ctl_b = scope.controller(&b).unwrap();
    {
        let ctl_b = ctl_b.clone();
        ctl_a
            .on_change(move |event| {
                if matches!(event, ControllerEvent::Resolved) {
                    let _ = ctl_b.invalidate();
                }
            })
            .unwrap();
    }
    {
        let ctl_a = ctl_a.clone();
        ctl_b
            .on_change(move |event| {
                if matches!(event, ControllerEvent::Resolved) {
                    let _ = ctl_a.invalidate();
                }
            })
            .unwrap();
    }

    ctl_a.invalidate().unwrap();
    let err = scope.flush().await.unwrap_err();
    assert!(matches!(err, WeftError::InvalidationLoop { .. }));

    let beta = *ctl_b.peek().unwrap();
    assert_eq!(beta, 1);
    let view_ctl = scope.controller(&view).unwrap();
    assert_eq!(view_ctl.state(), EntryState::Resolved);
    assert_eq!(view_ctl.peek().map(|v| *v), Some(beta * 10));
}

#[tokio::test]
async fn test_diamond_is_not_a_loop() {
    let root = provide("root", |_| async { Ok(1_i32) });
    let left = derive("left", root.clone(), |r, _| async move { Ok(*r + 1) });
    let right = derive("right", root.clone(), |r, _| async move { Ok(*r * 10) });
    let join = derive("join", (left, right), |(l, r), _| async move { Ok(*l + *r) });
    let scope = Scope::new(ScopeOptions::new());

    assert_eq!(*scope.resolve(&join).await.unwrap(), 12);

    scope.controller(&root).unwrap().set(2).unwrap();
    scope.flush().await.unwrap();

    assert_eq!(*scope.resolve(&join).await.unwrap(), 23);
}

#[tokio::test]
async fn test_flush_waits_for_inductive_invalidations() {
    let base = provide("base", |_| async { Ok(1_u64) });
    let first = derive("first", base.clone(), |b, _| async move { Ok(*b * 2) });
    let second = derive("second", first.clone(), |f, _| async move { Ok(*f * 2) });
    let third = derive("third", second.clone(), |s, _| async move { Ok(*s * 2) });
    let scope = Scope::new(ScopeOptions::new());

    assert_eq!(*scope.resolve(&third).await.unwrap(), 8);

    scope.controller(&base).unwrap().set(5).unwrap();
    scope.flush().await.unwrap();

    let ctl = scope.controller(&third).unwrap();
    assert_eq!(ctl.state(), EntryState::Resolved);
    assert_eq!(ctl.peek().map(|v| *v), Some(40));
}

#[tokio::test]
async fn test_self_invalidation_during_resolution_coalesces() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let refresher = provide("refresher", move |ctx| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            ctx.invalidate().unwrap();
            ctx.invalidate().unwrap();
        }
        async move { Ok(n) }
    });
    let scope = Scope::new(ScopeOptions::new());

    assert_eq!(*scope.resolve(&refresher).await.unwrap(), 0);
    scope.flush().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*scope.resolve(&refresher).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_entry_recovers_after_invalidation() {
    let healthy = Arc::new(AtomicUsize::new(0));
    let flag = healthy.clone();
    let service = provide("service", move |_| {
        let ok = flag.load(Ordering::SeqCst) == 1;
        async move {
            if ok {
                Ok("up")
            } else {
                Err(WeftError::msg("down"))
            }
        }
    });
    let status = derive("status", service.clone(), |s, _| async move { Ok(format!("service is {}", s)) });
    let scope = Scope::new(ScopeOptions::new());

    assert!(scope.resolve(&status).await.is_err());
    assert_eq!(scope.state_of(&status), EntryState::Failed);

    healthy.store(1, Ordering::SeqCst);
    scope.invalidate(&service).unwrap();
    scope.flush().await.unwrap();

    assert_eq!(scope.state_of(&status), EntryState::Resolved);
    assert_eq!(scope.resolve(&status).await.unwrap().as_str(), "service is up");
}
