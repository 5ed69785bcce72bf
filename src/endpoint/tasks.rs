use crate::err::*;
use crate::protocol::{CorrelationId, ResponsePayload};
use crate::registry::{Handler, Invocation};
use crate::transport::Address;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::core::Command;

/// A request currently being served.
pub(crate) struct InFlightTask<A> {
    pub(crate) peer: A,
    pub(crate) method: String,
    token: CancellationToken,
}

/// The requests currently being served, keyed by correlation id.
pub(crate) struct TaskTable<A> {
    tasks: HashMap<CorrelationId, InFlightTask<A>>,
}

impl<A: Address> TaskTable<A> {
    pub(crate) fn new() -> Self {
        TaskTable {
            tasks: HashMap::new(),
        }
    }

    pub(crate) fn contains(&self, id: &CorrelationId) -> bool {
        self.tasks.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Track a new task and return the token its invocation observes.
    pub(crate) fn insert(&mut self, id: CorrelationId, peer: A, method: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tasks.insert(
            id,
            InFlightTask {
                peer,
                method: method.to_string(),
                token: token.clone(),
            },
        );
        token
    }

    pub(crate) fn remove(&mut self, id: &CorrelationId) -> Option<InFlightTask<A>> {
        self.tasks.remove(id)
    }

    /// Request cancellation of the task `id` started by `peer`. Returns false if there is no
    /// such task.
    pub(crate) fn cancel(&mut self, id: &CorrelationId, peer: &A) -> bool {
        match self.tasks.get(id) {
            Some(task) if &task.peer == peer => {
                task.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every task and forget about them.
    pub(crate) fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.token.cancel();
        }
    }
}

/// Reports the end of a task to the endpoint core when dropped, so the task table entry goes
/// away however the task ends, including when the runtime aborts it.
pub(crate) struct TaskCompletion<A: Address> {
    id: CorrelationId,
    peer: A,
    outcome: Option<ResponsePayload>,
    done: WeakUnboundedSender<Command<A>>,
}

impl<A: Address> TaskCompletion<A> {
    pub(crate) fn new(id: CorrelationId, peer: A, done: WeakUnboundedSender<Command<A>>) -> Self {
        TaskCompletion {
            id,
            peer,
            outcome: None,
            done,
        }
    }

    pub(crate) fn complete(&mut self, response: ResponsePayload) {
        self.outcome = Some(response);
    }
}

impl<A: Address> Drop for TaskCompletion<A> {
    fn drop(&mut self) {
        if let Some(sender) = self.done.upgrade() {
            let _ = sender.send(Command::TaskDone {
                id: self.id,
                peer: self.peer.clone(),
                outcome: self.outcome.take(),
            });
        }
    }
}

/// Run one handler invocation as its own task. Cancelling `token` abandons the invocation and
/// completes the task without an outcome.
pub(crate) fn spawn_task<A: Address>(
    completion: TaskCompletion<A>,
    handler: Handler,
    invocation: Invocation,
    token: CancellationToken,
    workers: Arc<Semaphore>,
) {
    tokio::spawn(async move {
        let mut completion = completion;
        tokio::select! {
            biased;
            _ = token.cancelled() => {},
            response = invoke(handler, invocation, workers) => completion.complete(response),
        }
    });
}

/// Invoke `handler`, turning every failure, panics included, into a `RemoteError`.
pub(crate) async fn invoke(handler: Handler, invocation: Invocation, workers: Arc<Semaphore>) -> ResponsePayload {
    if let Some(f) = handler.as_async() {
        return match AssertUnwindSafe(async move { f(invocation).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(RemoteError::from),
            Err(panic) => Err(RemoteError::Panic(panic_message(panic))),
        };
    }

    let f = match handler.as_blocking() {
        Some(f) => f,
        None => return Err(RemoteError::Unavailable(invocation.method)),
    };

    let permit = match workers.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return Err(RemoteError::Unavailable(format!(
                "{}: worker pool closed",
                invocation.method
            )))
        }
    };

    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        f(invocation)
    })
    .await;

    match result {
        Ok(result) => result.map_err(RemoteError::from),
        Err(e) if e.is_panic() => Err(RemoteError::Panic(panic_message(e.into_panic()))),
        Err(e) => Err(RemoteError::Unavailable(e.to_string())),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
use crate::protocol::{Kwargs, Value};
#[cfg(test)]
use crate::registry::{HandlerError, HandlerResult};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn invocation(method: &str) -> (Invocation, CancellationToken) {
    let token = CancellationToken::new();
    (
        Invocation::new(method.into(), vec![], Kwargs::new(), token.clone()),
        token,
    )
}

#[cfg(test)]
fn workers() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(2))
}

#[cfg(test)]
async fn fail(_: Invocation) -> HandlerResult {
    Err(HandlerError::new("ValueError", "x"))
}

#[cfg(test)]
async fn explode(_: Invocation) -> HandlerResult {
    panic!("kaboom")
}

#[tokio::test]
async fn test_invoke_async() {
    let handler = Handler::new_async(|_| async { HandlerResult::Ok(Value::from(5)) });
    let (inv, _) = invocation("five");
    assert_eq!(Ok(Value::from(5)), invoke(handler, inv, workers()).await);
}

#[tokio::test]
async fn test_invoke_converts_handler_error() {
    let (inv, _) = invocation("boom");
    assert_eq!(
        Err(RemoteError::Handler {
            kind: "ValueError".into(),
            message: "x".into()
        }),
        invoke(Handler::new_async(fail), inv, workers()).await
    );
}

#[tokio::test]
async fn test_invoke_catches_async_panic() {
    let (inv, _) = invocation("explode");
    assert_eq!(
        Err(RemoteError::Panic("kaboom".into())),
        invoke(Handler::new_async(explode), inv, workers()).await
    );
}

#[tokio::test]
async fn test_invoke_blocking() {
    let handler = Handler::new_blocking(|inv| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(Value::from(inv.method.clone()))
    });
    let (inv, _) = invocation("blocking");
    assert_eq!(Ok(Value::from("blocking")), invoke(handler, inv, workers()).await);
}

#[tokio::test]
async fn test_invoke_catches_blocking_panic() {
    let handler = Handler::new_blocking(|_| panic!("blocking {}", "kaboom"));
    let (inv, _) = invocation("explode");
    assert_eq!(
        Err(RemoteError::Panic("blocking kaboom".into())),
        invoke(handler, inv, workers()).await
    );
}

#[tokio::test]
async fn test_invoke_blocking_on_closed_pool() {
    let handler = Handler::new_blocking(|_| Ok(Value::Null));
    let pool = workers();
    pool.close();
    let (inv, _) = invocation("late");
    assert!(matches!(
        invoke(handler, inv, pool).await,
        Err(RemoteError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_task_table_cancel() {
    let mut tasks = TaskTable::<String>::new();
    let id = CorrelationId::random();
    let token = tasks.insert(id, "a".to_string(), "slow.op");
    assert!(tasks.contains(&id));

    assert!(!tasks.cancel(&CorrelationId::random(), &"a".to_string()));
    assert!(!tasks.cancel(&id, &"b".to_string()));
    assert!(!token.is_cancelled());

    assert!(tasks.cancel(&id, &"a".to_string()));
    assert!(token.is_cancelled());

    let task = tasks.remove(&id).unwrap();
    assert_eq!("slow.op", task.method);
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_task_table_cancel_all() {
    let mut tasks = TaskTable::<String>::new();
    let tokens = (0..3)
        .map(|_| tasks.insert(CorrelationId::random(), "a".to_string(), "slow.op"))
        .collect::<Vec<_>>();
    assert_eq!(3, tasks.len());

    tasks.cancel_all();
    assert!(tasks.is_empty());
    assert!(tokens.iter().all(|t| t.is_cancelled()));
}

#[tokio::test]
async fn test_cancelled_task_completes_without_outcome() {
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Command<String>>();
    let id = CorrelationId::random();
    let (inv, token) = invocation("sys.sleep");
    let handler = Handler::new_async(|_| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        HandlerResult::Ok(Value::Null)
    });

    spawn_task(
        TaskCompletion::new(id, "a".to_string(), sender.downgrade()),
        handler,
        inv,
        token.clone(),
        workers(),
    );
    token.cancel();

    match receiver.recv().await {
        Some(Command::TaskDone {
            id: done_id,
            outcome,
            ..
        }) => {
            assert_eq!(id, done_id);
            assert!(outcome.is_none());
        }
        _ => panic!("expected TaskDone"),
    }
}

#[tokio::test]
async fn test_finished_task_reports_outcome() {
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Command<String>>();
    let id = CorrelationId::random();
    let (inv, token) = invocation("boom");

    spawn_task(
        TaskCompletion::new(id, "a".to_string(), sender.downgrade()),
        Handler::new_async(fail),
        inv,
        token,
        workers(),
    );

    match receiver.recv().await {
        Some(Command::TaskDone { peer, outcome, .. }) => {
            assert_eq!("a", peer);
            assert_eq!(
                Some(Err(RemoteError::Handler {
                    kind: "ValueError".into(),
                    message: "x".into()
                })),
                outcome
            );
        }
        _ => panic!("expected TaskDone"),
    }
}
