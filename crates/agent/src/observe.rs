//! Observation wrapper around a task driver.
//!
//! [`ObservedTask`] forwards every call to the driver it wraps and reports
//! status changes, property mutations and method invocations to registered
//! callbacks. It never alters results or ordering, and wrappers can be
//! stacked; each one subscribes to the status channel on its own.

use async_trait::async_trait;
use serde_json::Value;
use taskloop_config::TaskConfig;
use taskloop_core::error::TaskError;
use taskloop_core::event::{StatusChange, TaskEvents};
use taskloop_core::message::ContentBlock;
use tokio::sync::broadcast::Receiver;

use crate::task::{AbortHandle, Task, TaskDriver, TaskOutcome};

/// A property of the wrapped driver changed through the wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub name: &'static str,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodPhase {
    Enter,
    Exit,
}

/// A method of the wrapped driver was invoked through the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodCall {
    pub name: &'static str,
    pub phase: MethodPhase,
}

type StatusCallback = Box<dyn Fn(&StatusChange) + Send + Sync>;
type PropertyCallback = Box<dyn Fn(&PropertyChange) + Send + Sync>;
type MethodCallback = Box<dyn Fn(&MethodCall) + Send + Sync>;

/// One observer's callbacks. Unset callbacks are skipped.
#[derive(Default)]
pub struct TaskCallbacks {
    on_status: Option<StatusCallback>,
    on_property: Option<PropertyCallback>,
    on_method: Option<MethodCallback>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status(mut self, f: impl Fn(&StatusChange) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    pub fn on_property(mut self, f: impl Fn(&PropertyChange) + Send + Sync + 'static) -> Self {
        self.on_property = Some(Box::new(f));
        self
    }

    pub fn on_method(mut self, f: impl Fn(&MethodCall) + Send + Sync + 'static) -> Self {
        self.on_method = Some(Box::new(f));
        self
    }
}

/// Task properties compared around `execute`, in notification order.
fn snapshot(task: &Task) -> [(&'static str, Value); 5] {
    [
        ("status", serde_json::to_value(task.status).unwrap_or_default()),
        ("consecutive_mistakes", task.consecutive_mistakes.into()),
        ("error_count", task.errors.len().into()),
        ("result", task.result.clone().into()),
        ("abort_reason", task.abort_reason.clone().into()),
    ]
}

fn notify_status(callbacks: &[TaskCallbacks], change: &StatusChange) {
    for cb in callbacks.iter().filter_map(|c| c.on_status.as_ref()) {
        cb(change);
    }
}

/// Wraps a [`TaskDriver`] and reports what happens to it.
pub struct ObservedTask<D: TaskDriver> {
    inner: D,
    callbacks: Vec<TaskCallbacks>,
}

impl<D: TaskDriver> ObservedTask<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            callbacks: Vec::new(),
        }
    }

    /// Register another observer.
    pub fn observe(mut self, callbacks: TaskCallbacks) -> Self {
        self.callbacks.push(callbacks);
        self
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn notify_method(&self, name: &'static str, phase: MethodPhase) {
        let call = MethodCall { name, phase };
        for cb in self.callbacks.iter().filter_map(|c| c.on_method.as_ref()) {
            cb(&call);
        }
    }

    fn notify_property(&self, name: &'static str, old: Value, new: Value) {
        if old == new {
            return;
        }
        let change = PropertyChange { name, old, new };
        for cb in self.callbacks.iter().filter_map(|c| c.on_property.as_ref()) {
            cb(&change);
        }
    }

    fn drain(&self, rx: &mut Receiver<StatusChange>) {
        while let Ok(change) = rx.try_recv() {
            notify_status(&self.callbacks, &change);
        }
    }
}

#[async_trait]
impl<D: TaskDriver> TaskDriver for ObservedTask<D> {
    fn task(&self) -> &Task {
        self.inner.task()
    }

    fn events(&self) -> &TaskEvents {
        self.inner.events()
    }

    fn config(&self) -> &TaskConfig {
        self.inner.config()
    }

    fn abort_handle(&self) -> AbortHandle {
        self.notify_method("abort_handle", MethodPhase::Enter);
        let handle = self.inner.abort_handle();
        self.notify_method("abort_handle", MethodPhase::Exit);
        handle
    }

    fn set_mistake_limit(&mut self, limit: u32) {
        self.notify_method("set_mistake_limit", MethodPhase::Enter);
        let old = self.inner.config().mistake_limit;
        self.inner.set_mistake_limit(limit);
        let new = self.inner.config().mistake_limit;
        self.notify_property("mistake_limit", old.into(), new.into());
        self.notify_method("set_mistake_limit", MethodPhase::Exit);
    }

    fn set_max_retry_attempts(&mut self, attempts: u32) {
        self.notify_method("set_max_retry_attempts", MethodPhase::Enter);
        let old = self.inner.config().max_retry_attempts;
        self.inner.set_max_retry_attempts(attempts);
        let new = self.inner.config().max_retry_attempts;
        self.notify_property("max_retry_attempts", old.into(), new.into());
        self.notify_method("set_max_retry_attempts", MethodPhase::Exit);
    }

    fn set_request_timeout_ms(&mut self, timeout_ms: u64) {
        self.notify_method("set_request_timeout_ms", MethodPhase::Enter);
        let old = self.inner.config().request_timeout_ms;
        self.inner.set_request_timeout_ms(timeout_ms);
        let new = self.inner.config().request_timeout_ms;
        self.notify_property("request_timeout_ms", old.into(), new.into());
        self.notify_method("set_request_timeout_ms", MethodPhase::Exit);
    }

    async fn execute(&mut self, content: Vec<ContentBlock>) -> Result<TaskOutcome, TaskError> {
        self.notify_method("execute", MethodPhase::Enter);
        let before = snapshot(self.inner.task());
        let mut status = self.inner.events().subscribe_status_changed();

        let result = {
            let callbacks = &self.callbacks;
            let run = self.inner.execute(content);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    Ok(change) = status.recv() => notify_status(callbacks, &change),
                }
            }
        };

        self.drain(&mut status);
        for ((name, old), (_, new)) in before.into_iter().zip(snapshot(self.inner.task())) {
            self.notify_property(name, old, new);
        }
        self.notify_method("execute", MethodPhase::Exit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskLoop;
    use crate::test_helpers::{MockWorkspace, ScriptedTurns, completion_turn, text_turn};
    use std::sync::{Arc, Mutex};
    use taskloop_core::event::TaskStatus;

    fn completing_loop() -> TaskLoop {
        TaskLoop::new(
            Arc::new(ScriptedTurns::new(vec![completion_turn("c1", "done")])),
            Arc::new(MockWorkspace::new(&["attempt_completion"])),
            TaskConfig::default(),
        )
    }

    #[tokio::test]
    async fn status_changes_reach_observer_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut task = ObservedTask::new(completing_loop()).observe(
            TaskCallbacks::new().on_status(move |c| sink.lock().unwrap().push((c.from, c.to))),
        );

        let outcome = task.execute(vec![ContentBlock::text("go")]).await.unwrap();

        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TaskStatus::Idle, TaskStatus::Running),
                (TaskStatus::Running, TaskStatus::Completed)
            ]
        );
    }

    #[tokio::test]
    async fn property_and_method_callbacks_fire() {
        let props = Arc::new(Mutex::new(Vec::new()));
        let methods = Arc::new(Mutex::new(Vec::new()));
        let (p, m) = (props.clone(), methods.clone());
        let mut task = ObservedTask::new(completing_loop()).observe(
            TaskCallbacks::new()
                .on_property(move |c| p.lock().unwrap().push(c.clone()))
                .on_method(move |c| m.lock().unwrap().push(*c)),
        );

        task.set_mistake_limit(7);
        task.set_mistake_limit(7);

        let props = props.lock().unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].name, "mistake_limit");
        assert_eq!(props[0].old, Value::from(3));
        assert_eq!(props[0].new, Value::from(7));
        assert_eq!(task.config().mistake_limit, 7);

        let methods = methods.lock().unwrap();
        assert_eq!(methods.len(), 4);
        assert_eq!(
            methods[0],
            MethodCall {
                name: "set_mistake_limit",
                phase: MethodPhase::Enter
            }
        );
    }

    #[tokio::test]
    async fn execute_reports_task_property_changes() {
        let backend = ScriptedTurns::new(vec![text_turn("thinking"), completion_turn("c1", "done")]);
        let inner = TaskLoop::new(
            Arc::new(backend),
            Arc::new(MockWorkspace::new(&["attempt_completion"])),
            TaskConfig::default(),
        );
        let props = Arc::new(Mutex::new(Vec::new()));
        let p = props.clone();
        let mut task = ObservedTask::new(inner)
            .observe(TaskCallbacks::new().on_property(move |c| p.lock().unwrap().push(c.clone())));

        task.execute(vec![ContentBlock::text("go")]).await.unwrap();

        let props = props.lock().unwrap();
        let names: Vec<_> = props.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["status", "error_count", "result"]);
        assert_eq!(props[0].old, Value::from("idle"));
        assert_eq!(props[0].new, Value::from("completed"));
        assert_eq!(props[1].new, Value::from(1));
        assert_eq!(props[2].old, Value::Null);
        assert_eq!(props[2].new, Value::from("done"));
    }

    #[tokio::test]
    async fn stacked_wrappers_each_observe() {
        let outer_seen = Arc::new(Mutex::new(0));
        let inner_seen = Arc::new(Mutex::new(0));
        let (o, i) = (outer_seen.clone(), inner_seen.clone());

        let inner = ObservedTask::new(completing_loop())
            .observe(TaskCallbacks::new().on_status(move |_| *i.lock().unwrap() += 1));
        let mut outer = ObservedTask::new(inner)
            .observe(TaskCallbacks::new().on_status(move |_| *o.lock().unwrap() += 1));

        let outcome = outer.execute(vec![ContentBlock::text("go")]).await.unwrap();

        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert_eq!(*outer_seen.lock().unwrap(), 2);
        assert_eq!(*inner_seen.lock().unwrap(), 2);
        assert_eq!(outer.task().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn wrapper_does_not_change_errors() {
        let backend = ScriptedTurns::new(vec![crate::test_helpers::tool_turn(
            "c1",
            "missing",
            serde_json::json!({}),
        )]);
        let inner = TaskLoop::new(
            Arc::new(backend),
            Arc::new(MockWorkspace::new(&["attempt_completion"])),
            TaskConfig::default(),
        );
        let mut task = ObservedTask::new(inner);

        let err = task.execute(vec![ContentBlock::text("go")]).await.unwrap_err();
        assert_eq!(err.code(), "tool_not_found");
    }
}
