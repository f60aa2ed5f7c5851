use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::{derive, provide, EntryState, RuntimeEvent, Scope, ScopeOptions, Tag, WeftError};

fn counting<T: Clone + Send + Sync + 'static>(
    name: &str,
    value: T,
    calls: Arc<AtomicUsize>,
) -> weft::Executor<T> {
    provide(name, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move { Ok(value) }
    })
}

#[tokio::test]
async fn test_resolve_twice_calls_factory_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let one = counting("one", 1_i32, calls.clone());
    let scope = Scope::new(ScopeOptions::new());

    let first = scope.resolve(&one).await.unwrap();
    let second = scope.resolve(&one).await.unwrap();

    assert_eq!(*first, 1);
    assert_eq!(*second, 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_factory_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow = provide("slow", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok("ready".to_string())
        }
    });
    let scope = Scope::new(ScopeOptions::new());

    let resolves = (0..8).map(|_| {
        let scope = scope.clone();
        let slow = slow.clone();
        tokio::spawn(async move { scope.resolve(&slow).await })
    });
    let outcomes = futures::future::join_all(resolves).await;

    for outcome in outcomes {
        assert_eq!(outcome.unwrap().unwrap().as_str(), "ready");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_derived_sum_of_two_roots() {
    let a = provide("a", |_| async { Ok(2_i64) });
    let b = provide("b", |_| async { Ok(3_i64) });
    let sum = derive("sum", (a, b), |(x, y), _| async move { Ok(*x + *y) });
    let scope = Scope::new(ScopeOptions::new());

    assert_eq!(*scope.resolve(&sum).await.unwrap(), 5);
}

#[tokio::test]
async fn test_list_and_map_dependency_shapes() {
    let parts: Vec<_> = (1..=4_u32)
        .map(|n| provide(format!("part-{}", n), move |_| async move { Ok(n) }))
        .collect();
    let total = derive("total", parts, |values, _| async move {
        Ok(values.iter().map(|v| **v).sum::<u32>())
    });

    let mut named = BTreeMap::new();
    named.insert("host".to_string(), provide("host", |_| async { Ok("db".to_string()) }));
    named.insert("port".to_string(), provide("port", |_| async { Ok("5432".to_string()) }));
    let address = derive("address", named, |m, _| async move {
        Ok(format!("{}:{}", m["host"], m["port"]))
    });

    let scope = Scope::new(ScopeOptions::new());
    assert_eq!(*scope.resolve(&total).await.unwrap(), 10);
    assert_eq!(scope.resolve(&address).await.unwrap().as_str(), "db:5432");
}

#[tokio::test]
async fn test_factory_failure_is_cached_and_observed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let broken = provide("broken", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<u8, _>(WeftError::msg("connection refused")) }
    });
    let scope = Scope::new(ScopeOptions::new());

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    scope.on_error(move |event| sink.lock().unwrap().push(event.executor.clone()));

    let err = scope.resolve(&broken).await.unwrap_err();
    match &err {
        WeftError::ExecutorResolution { executor, cause } => {
            assert_eq!(executor, "broken");
            assert_eq!(cause.to_string(), "connection refused");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(scope.resolve(&broken).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*observed.lock().unwrap(), vec!["broken".to_string()]);
    assert_eq!(scope.state_of(&broken), EntryState::Failed);
}

#[tokio::test]
async fn test_dependency_failure_wraps_cause() {
    let broken = provide("config", |_| async { Err::<u16, _>(WeftError::msg("missing file")) });
    let server = derive("server", broken, |port, _| async move { Ok(format!("listening on {}", port)) });
    let scope = Scope::new(ScopeOptions::new());

    let err = scope.resolve(&server).await.unwrap_err();
    match &err {
        WeftError::DependencyResolution {
            executor,
            dependency,
            cause,
        } => {
            assert_eq!(executor, "server");
            assert_eq!(dependency, "config");
            assert!(matches!(cause.as_ref(), WeftError::ExecutorResolution { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.root_cause().to_string(), "missing file");
}

#[tokio::test]
async fn test_presets_replace_factories() {
    let calls = Arc::new(AtomicUsize::new(0));
    let real = counting("database-url", "postgres://prod".to_string(), calls.clone());
    let stub = provide("stub-url", |_| async { Ok("sqlite://memory".to_string()) });
    let port = provide("port", |_| async { Ok(8080_u16) });
    let addr = derive("addr", (real.clone(), port.clone()), |(url, port), _| async move {
        Ok(format!("{} @ {}", url, port))
    });

    let scope = Scope::new(ScopeOptions::new().preset_with(&real, &stub).preset(&port, 9000));

    assert_eq!(scope.resolve(&addr).await.unwrap().as_str(), "sqlite://memory @ 9000");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_factory_reads_executor_then_scope_tags() {
    let region: Tag<String> = Tag::new("region").with_default("us-east".to_string());
    let tier: Tag<u8> = Tag::new("tier");

    let r1 = region.clone();
    let t1 = tier.clone();
    let describe = provide("describe", move |ctx| {
        let region = ctx.tag(&r1);
        let tier = ctx.tag(&t1);
        async move { Ok(format!("{:?}/{:?}", region, tier)) }
    })
    .with_tag(tier.entry(2).unwrap());

    let plain = Scope::new(ScopeOptions::new());
    assert_eq!(
        plain.resolve(&describe).await.unwrap().as_str(),
        "Some(\"us-east\")/Some(2)"
    );

    let eu = Scope::new(ScopeOptions::new().tag(region.entry("eu-west".to_string()).unwrap()));
    assert_eq!(
        eu.resolve(&describe).await.unwrap().as_str(),
        "Some(\"eu-west\")/Some(2)"
    );
    assert_eq!(eu.tag(&region).as_deref(), Some("eu-west"));
}

#[tokio::test]
async fn test_release_runs_cleanups_and_allows_fresh_resolution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cleaned = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let cleanup_counter = cleaned.clone();
    let pool = provide("pool", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        let cleanup_counter = cleanup_counter.clone();
        ctx.cleanup(move || async move {
            cleanup_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        async { Ok(vec![1, 2, 3]) }
    });
    let scope = Scope::new(ScopeOptions::new());

    scope.resolve(&pool).await.unwrap();
    scope.release(&pool).await.unwrap();
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    assert_eq!(scope.state_of(&pool), EntryState::Idle);

    scope.resolve(&pool).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resolve_during_release_joins_the_running_factory() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (running, highest) = (active.clone(), peak.clone());
    let session = provide("session", move |_| {
        let running = running.clone();
        let highest = highest.clone();
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            highest.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok("token".to_string())
        }
    });
    let scope = Scope::new(ScopeOptions::new());

    let first = tokio::spawn({
        let (scope, session) = (scope.clone(), session.clone());
        async move { scope.resolve(&session).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let release = tokio::spawn({
        let (scope, session) = (scope.clone(), session.clone());
        async move { scope.release(&session).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = scope.resolve(&session).await.unwrap();

    assert_eq!(second.as_str(), "token");
    assert_eq!(first.await.unwrap().unwrap().as_str(), "token");
    release.await.unwrap().unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(scope.state_of(&session), EntryState::Idle);
}

#[tokio::test]
async fn test_dispose_cleans_up_in_reverse_and_rejects_later_calls() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    let resource = provide("resource", move |ctx| {
        for name in ["c1", "c2", "c3"] {
            let log = log.clone();
            ctx.cleanup(move || async move {
                log.lock().unwrap().push(name);
                Ok(())
            });
        }
        async { Ok(()) }
    });
    let scope = Scope::new(ScopeOptions::new());
    let mut events = scope.subscribe();

    scope.resolve(&resource).await.unwrap();
    scope.dispose().await.unwrap();
    scope.dispose().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["c3", "c2", "c1"]);
    assert!(scope.is_disposed());
    assert!(matches!(scope.resolve(&resource).await, Err(WeftError::DisposedScope)));
    assert!(matches!(scope.create_context(), Err(WeftError::DisposedScope)));
    assert!(matches!(scope.invalidate(&resource), Err(WeftError::DisposedScope)));

    let mut saw_disposed = false;
    while let Ok(event) = events.try_recv() {
        if event == RuntimeEvent::ScopeDisposed {
            saw_disposed = true;
        }
    }
    assert!(saw_disposed);
}

#[tokio::test]
async fn test_dispose_releases_dependents_before_dependencies() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    let base = provide("base", move |ctx| {
        let log = log.clone();
        ctx.cleanup(move || async move {
            log.lock().unwrap().push("base");
            Ok(())
        });
        async { Ok(1_u8) }
    });
    let log = order.clone();
    let top = derive("top", base, move |b, ctx| {
        let log = log.clone();
        ctx.cleanup(move || async move {
            log.lock().unwrap().push("top");
            Ok(())
        });
        async move { Ok(*b + 1) }
    });
    let scope = Scope::new(ScopeOptions::new());

    scope.resolve(&top).await.unwrap();
    scope.dispose().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["top", "base"]);
}
