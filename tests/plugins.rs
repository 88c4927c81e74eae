//! Plugins built entirely on the action hooks.

use serde_json::{Value, json};
use stash::query::{QueryAction, QueryActionOutput, SerializedCache};
use stash::{AsyncStatus, Client, Failure, MutationOptions, PluginContext, QueryOptions, Status, key};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

/// Re-fetches a failed query up to `attempts` times.
struct Retry {
    attempts: usize,
}

#[derive(Default)]
struct RetryCount(AtomicUsize);

impl stash::Plugin for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    fn install(&self, context: &PluginContext) -> Result<(), Failure> {
        let cache = Arc::downgrade(&context.query_cache);
        let attempts = self.attempts;
        context.on_query_action(move |event| {
            match event.args() {
                QueryAction::Extend { entry } => {
                    entry.set_ext(RetryCount::default());
                },
                QueryAction::Fetch { entry } => {
                    let (cache, entry) = (cache.clone(), Arc::clone(entry));
                    event.on_error(move |failure| {
                        let Some(count) = entry.ext::<RetryCount>() else { return };
                        if failure.is_abort() || count.0.fetch_add(1, Ordering::SeqCst) >= attempts {
                            return;
                        }
                        if let Some(cache) = cache.upgrade() {
                            drop(cache.fetch(&entry));
                        }
                    });
                },
                _ => {},
            }
        });
        Ok(())
    }
}

/// Snapshots the whole query cache after every settled write.
struct Persist {
    snapshot: Arc<Mutex<SerializedCache>>,
}

impl stash::Plugin for Persist {
    fn install(&self, context: &PluginContext) -> Result<(), Failure> {
        let cache = Arc::downgrade(&context.query_cache);
        let snapshot = self.snapshot.clone();
        context.on_query_action(move |event| {
            if !matches!(event.name(), "fetch" | "setQueryData" | "remove") {
                return;
            }
            let (cache, snapshot) = (cache.clone(), snapshot.clone());
            event.after(move |_| {
                if let Some(cache) = cache.upgrade() {
                    *snapshot.lock().unwrap() = cache.serialize();
                }
            });
        });
        Ok(())
    }
}

fn recorder(log: &Log, tag: &'static str) -> impl Fn(&PluginContext) -> Result<(), Failure> + Send + Sync + 'static {
    let log = log.clone();
    move |context: &PluginContext| {
        let log = log.clone();
        context.on_query_action(move |event| {
            let name = event.name();
            log.lock().unwrap().push(format!("{tag}:{name}"));
            let log = log.clone();
            event.after(move |_| log.lock().unwrap().push(format!("{tag}:{name}:after")));
        });
        Ok(())
    }
}

#[tokio::test]
async fn retry_plugin_recovers_from_transient_failures() {
    let client = Client::builder().plugin(Retry { attempts: 3 }).build().unwrap();
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let entry = queries.ensure(QueryOptions::new(key!["flaky"], move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n < 3 {
                return Err(Failure::msg(format!("attempt {n}")));
            }
            Ok(n)
        }
    }));

    let mut state = entry.subscribe_state();
    assert!(queries.fetch(&entry).await.is_err());
    state.wait_for(|state| state.status() == Status::Success).await.unwrap();
    assert_eq!(entry.state().data(), Some(&json!(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_plugin_gives_up() {
    let client = Client::builder().plugin(Retry { attempts: 2 }).build().unwrap();
    let queries = client.query_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let entry = queries.ensure(QueryOptions::new(key!["down"], move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Value, _>(Failure::msg("down")) }
    }));

    assert!(queries.fetch(&entry).await.is_err());
    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) < 3 || entry.async_status() != AsyncStatus::Idle {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(entry.state().status(), Status::Error);
}

#[tokio::test]
async fn persist_plugin_snapshots_writes() {
    let snapshot = Arc::new(Mutex::new(SerializedCache::new()));
    let client = Client::builder().plugin(Persist { snapshot: snapshot.clone() }).build().unwrap();
    let queries = client.query_cache();

    queries.set_query_data(&key!["todos"], json!(["a"]));
    let entry = queries.ensure(QueryOptions::new(key!["count"], |_| async { Ok::<_, Failure>(7) }));
    queries.fetch(&entry).await.unwrap();

    let saved = snapshot.lock().unwrap().clone();
    assert_eq!(saved.len(), 2);
    let restored = Client::new();
    restored.query_cache().hydrate(saved).unwrap();
    assert_eq!(restored.query_cache().get_query_data(&key!["todos"]), Some(json!(["a"])));
    assert_eq!(restored.query_cache().get_query_data(&key!["count"]), Some(json!(7)));
}

#[tokio::test]
async fn handlers_compose_in_install_order() {
    let log = Log::default();
    let client = Client::builder().plugin(recorder(&log, "a")).plugin(recorder(&log, "b")).build().unwrap();
    let queries = client.query_cache();
    let entry = queries.ensure(QueryOptions::new(key!["one"], |_| async { Ok::<_, Failure>(1) }));
    queries.fetch(&entry).await.unwrap();

    let log = log.lock().unwrap().clone();
    let fetch: Vec<_> = log.iter().filter(|line| line.contains("fetch")).cloned().collect();
    assert_eq!(fetch, ["a:fetch", "b:fetch", "a:fetch:after", "b:fetch:after"]);
    assert!(log.contains(&String::from("a:extend")));
    assert!(log.contains(&String::from("b:ensure:after")));
}

#[tokio::test]
async fn panicking_plugin_does_not_break_others() {
    let log = Log::default();
    let client = Client::builder()
        .plugin(|context: &PluginContext| -> Result<(), Failure> {
            context.on_query_action(|event| {
                if event.name() == "fetch" {
                    event.after(|_| panic!("after handler exploded"));
                }
            });
            context.on_query_action(|event| {
                if event.name() == "ensure" {
                    panic!("subscriber exploded");
                }
            });
            Ok(())
        })
        .plugin(recorder(&log, "ok"))
        .build()
        .unwrap();
    let queries = client.query_cache();
    let entry = queries.ensure(QueryOptions::new(key!["safe"], |_| async { Ok::<_, Failure>("fine") }));
    let state = queries.fetch(&entry).await.unwrap();
    assert_eq!(state.data(), Some(&json!("fine")));

    let log = log.lock().unwrap();
    assert!(log.contains(&String::from("ok:ensure:after")));
    assert!(log.contains(&String::from("ok:fetch:after")));
}

#[tokio::test]
async fn dispose_detaches_plugins() {
    let log = Log::default();
    let client = Client::builder().plugin(recorder(&log, "p")).build().unwrap();
    let queries = client.query_cache();
    queries.set_query_data(&key!["before"], json!(1));
    let seen = log.lock().unwrap().len();
    assert!(seen > 0);

    client.dispose();
    queries.set_query_data(&key!["after"], json!(2));
    assert_eq!(log.lock().unwrap().len(), seen);
    assert_eq!(queries.get_query_data(&key!["after"]), Some(json!(2)));
}

#[tokio::test]
async fn mutation_hooks_see_outcome() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let client = Client::builder()
        .plugin(move |context: &PluginContext| -> Result<(), Failure> {
            let sink = sink.clone();
            context.on_mutation_action(move |event| {
                if event.name() != "mutate" {
                    return;
                }
                let (ok, err) = (sink.clone(), sink.clone());
                event.after(move |_| ok.lock().unwrap().push(String::from("ok")));
                event.on_error(move |failure| err.lock().unwrap().push(failure.to_string()));
            });
            Ok(())
        })
        .build()
        .unwrap();
    let mutations = client.mutation_cache();

    let good = mutations.create(MutationOptions::new(|vars: Value, _| async move { Ok::<_, Failure>(vars) }));
    let good = mutations.ensure(&good, json!(1)).unwrap();
    mutations.mutate(&good, json!(1)).await.unwrap();

    let bad = mutations.create(MutationOptions::new(|_, _| async { Err::<Value, _>(Failure::msg("nope")) }));
    let bad = mutations.ensure(&bad, json!(2)).unwrap();
    assert!(mutations.mutate(&bad, json!(2)).await.is_err());

    assert_eq!(*outcomes.lock().unwrap(), ["ok", "nope"]);
}

#[test]
fn extend_runs_once_per_entry() {
    let extended = Arc::new(AtomicUsize::new(0));
    let ensured = Arc::new(Mutex::new(Vec::new()));
    let (counter, seen) = (extended.clone(), ensured.clone());
    let client = Client::builder()
        .plugin(move |context: &PluginContext| -> Result<(), Failure> {
            let (counter, tagged) = (counter.clone(), seen.clone());
            context.on_query_action(move |event| {
                if let QueryAction::Extend { entry } = event.args() {
                    counter.fetch_add(1, Ordering::SeqCst);
                    entry.set_ext(String::from("tagged"));
                }
                if event.name() == "ensure" {
                    let tagged = tagged.clone();
                    event.after(move |output| {
                        if let QueryActionOutput::Entry(entry) = output {
                            tagged.lock().unwrap().push(entry.ext::<String>().is_some());
                        }
                    });
                }
            });
            Ok(())
        })
        .build()
        .unwrap();
    let queries = client.query_cache();
    for _ in 0..3 {
        queries.ensure(QueryOptions::new(key!["tagged"], |_| async { Ok::<_, Failure>(1) }));
    }
    queries.set_query_data(&key!["other"], json!(1));
    assert_eq!(extended.load(Ordering::SeqCst), 2);
    // Every ensure, including the first, already sees the extension.
    assert_eq!(*ensured.lock().unwrap(), [true, true, true]);
}
