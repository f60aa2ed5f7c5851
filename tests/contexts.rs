use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::{ContextOptions, Exec, ExecutionContext, Scope, ScopeOptions, Tag, WeftError};

#[tokio::test]
async fn test_sibling_children_do_not_share_data() {
    let request_id: Tag<String> = Tag::new("request-id");
    let scope = Scope::new(ScopeOptions::new());
    let root = scope.create_context().unwrap();

    let branch = |id: &'static str| {
        let tag = request_id.clone();
        Exec::function(format!("branch-{}", id), move |ctx: ExecutionContext| async move {
            ctx.set(&tag, id.to_string())?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.get(&tag)
        })
    };

    let values = root.parallel(vec![branch("a"), branch("b")]).await.unwrap();
    assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(root.find(&request_id).unwrap(), None);
}

#[tokio::test]
async fn test_seek_walks_ancestors_but_find_stays_local() {
    let tenant: Tag<String> = Tag::new("tenant").with_default("public".to_string());
    let scope = Scope::new(ScopeOptions::new());
    let root = scope
        .create_context_with(ContextOptions::new().tag(tenant.entry("acme".to_string()).unwrap()))
        .unwrap();

    let t = tenant.clone();
    let (found, sought, got) = root
        .exec(Exec::function("inner", move |ctx: ExecutionContext| async move {
            let found = ctx.find(&t)?;
            let sought = ctx.seek(&t)?;
            let got = ctx.get(&t);
            Ok((found, sought, got.is_err()))
        }))
        .await
        .unwrap();

    assert_eq!(found.as_deref(), Some("public"));
    assert_eq!(sought.as_deref(), Some("acme"));
    assert!(got);
}

#[tokio::test]
async fn test_close_runs_callbacks_once_and_rejects_reuse() {
    let scope = Scope::new(ScopeOptions::new());
    let root = scope.create_context().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second"] {
        let log = order.clone();
        root.on_close(move || async move {
            log.lock().unwrap().push(name);
            Ok(())
        })
        .unwrap();
    }

    let details = root.close().await.unwrap();
    assert!(details.ended_at.is_some());
    assert!(root.is_closed());
    assert!(matches!(root.close().await, Err(WeftError::ClosedContext { .. })));
    assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);

    let reused = root
        .exec(Exec::function("late", |_ctx: ExecutionContext| async { Ok(1_u8) }))
        .await;
    assert!(matches!(reused, Err(WeftError::ClosedContext { .. })));
}

#[tokio::test]
async fn test_parent_cancellation_reaches_running_child() {
    let scope = Scope::new(ScopeOptions::new());
    let root = scope.create_context().unwrap();

    let canceller = root.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel("operator abort");
    });

    let err = root
        .exec(Exec::function("long-poll", |ctx: ExecutionContext| async move {
            ctx.signal().cancelled().await;
            Err::<(), _>(WeftError::cancelled(ctx.cancel_reason().unwrap_or_default()))
        }))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(err.to_string().contains("operator abort"));

    let refused = root
        .exec(Exec::function("after", |_ctx: ExecutionContext| async { Ok(()) }))
        .await
        .unwrap_err();
    assert!(refused.is_cancelled());
}

#[tokio::test]
async fn test_sequential_execs_see_their_own_input() {
    let input: Tag<u32> = Tag::new("input");
    let scope = Scope::new(ScopeOptions::new());
    let root = scope.create_context().unwrap();

    let mut seen = Vec::new();
    for n in [1_u32, 2] {
        let tag = input.clone();
        let value = root
            .exec(
                Exec::function("read-input", move |ctx: ExecutionContext| async move { ctx.get(&tag) })
                    .tag(input.entry(n).unwrap()),
            )
            .await
            .unwrap();
        seen.push(value);
    }

    assert_eq!(seen, vec![1, 2]);
}

#[tokio::test]
async fn test_children_close_before_exec_returns() {
    let scope = Scope::new(ScopeOptions::new());
    let root = scope.create_context().unwrap();
    let closed = Arc::new(AtomicUsize::new(0));

    let counter = closed.clone();
    let child = root
        .exec(Exec::function("registers", move |ctx: ExecutionContext| async move {
            ctx.on_close(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            assert_eq!(ctx.depth()?, 1);
            Ok(ctx)
        }))
        .await
        .unwrap();

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(child.is_closed());
    assert!(!root.is_closed());
    assert!(matches!(child.parent(), Err(WeftError::ClosedContext { .. })));
}

#[tokio::test]
async fn test_dispose_closes_live_contexts() {
    let scope = Scope::new(ScopeOptions::new());
    let root = scope.create_context().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    root.on_close(move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    scope.dispose().await.unwrap();

    assert!(root.is_closed());
    assert!(root.is_cancelled());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
