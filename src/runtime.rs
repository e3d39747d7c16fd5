//! Runtime configuration and the acquisition context streams run in.

use std::{fmt, sync::Arc};

use crate::{
    clock::{Clock, SystemClock},
    drop::close_on_drop,
    scope::Scope,
    task::{self, Task},
    Exit,
};

const DEFAULT_NAME: &str = "strand";
const DEFAULT_BUFFER_SIZE: usize = 16;

/// A builder object that can be used to configure a [`Runtime`].
#[derive(Clone)]
pub struct RuntimeBuilder {
    clock: Option<Arc<dyn Clock>>,
    name: String,
    buffer_size: usize,
}

impl RuntimeBuilder {
    /// Sets the clock used by time-based combinators. Defaults to [`SystemClock`].
    pub fn clock<C: Clock>(self, clock: C) -> Self {
        Self {
            clock: Some(Arc::new(clock)),
            ..self
        }
    }

    /// Sets the prefix of task thread names.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// Sets the queue capacity used by concurrent combinators that are not given one explicitly.
    ///
    /// By default, a capacity of 16 chunks is used.
    #[inline]
    pub fn buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            ..self
        }
    }

    /// Creates the runtime.
    pub fn build(self) -> Runtime {
        Runtime {
            inner: Arc::new(Config {
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
                name: self.name,
                buffer_size: self.buffer_size,
            }),
        }
    }
}

struct Config {
    clock: Arc<dyn Clock>,
    name: String,
    buffer_size: usize,
}

/// Configuration shared by every task a stream spawns.
///
/// Terminal operations such as [`Stream::run_collect`][crate::Stream::run_collect] take a
/// `&Runtime`. Runtimes are cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Config>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.name)
            .field("buffer_size", &self.inner.buffer_size)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a builder that can be used to configure a [`Runtime`].
    #[inline]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            clock: None,
            name: DEFAULT_NAME.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// The clock time-based combinators use.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// The prefix of the names of task threads.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The buffer size of combinators that are not given one explicitly.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Spawns a task that is not tied to any scope.
    ///
    /// The caller is responsible for waiting for it.
    pub fn fork<E, T, F>(&self, f: F) -> Task<E, T>
    where
        E: Send + 'static,
        T: Send + 'static,
        F: FnOnce() -> Exit<E, T> + Send + 'static,
    {
        task::spawn(&self.inner.name, f)
    }

    /// Runs `f` with a fresh root context, closing its scope when `f` returns or unwinds.
    ///
    /// Everything `f` forks or subscribes to through the context is torn down before this returns.
    pub fn scoped<T, F: FnOnce(&Context<()>) -> T>(&self, f: F) -> T {
        let scope = Scope::new();
        let _close = close_on_drop(scope.clone());
        f(&Context::new(Arc::new(()), scope, self.clone()))
    }
}

/// Everything a stream needs while being acquired: its environment, the scope owning its
/// resources, and the runtime.
pub struct Context<R> {
    env: Arc<R>,
    scope: Scope,
    runtime: Runtime,
}

impl<R> Clone for Context<R> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            scope: self.scope.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<R> Context<R> {
    pub(crate) fn new(env: Arc<R>, scope: Scope, runtime: Runtime) -> Self {
        Self {
            env,
            scope,
            runtime,
        }
    }

    /// The environment streams read through [`Stream::environment`].
    pub fn env(&self) -> &Arc<R> {
        &self.env
    }

    /// The scope that resources acquired in this context are tied to.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The runtime this context belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The runtime's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.runtime.clock()
    }

    /// The same context, with a child scope that closes no later than this one.
    pub fn child(&self) -> Context<R> {
        self.with_scope(self.scope.child())
    }

    /// This context, with resources tied to `scope` instead.
    pub fn with_scope(&self, scope: Scope) -> Context<R> {
        Context {
            env: self.env.clone(),
            scope,
            runtime: self.runtime.clone(),
        }
    }

    /// This context, with `env` as the environment.
    pub fn with_env<R2>(&self, env: Arc<R2>) -> Context<R2> {
        Context {
            env,
            scope: self.scope.clone(),
            runtime: self.runtime.clone(),
        }
    }

    /// Spawns a task that is interrupted and waited for when this context's scope closes.
    pub fn fork<E, T, F>(&self, f: F) -> Task<E, T>
    where
        E: Send + 'static,
        T: Send + 'static,
        F: FnOnce() -> Exit<E, T> + Send + 'static,
    {
        let task = self.runtime.fork(f);
        task.register(&self.scope);
        task
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{clock::TestClock, task::signal};

    #[test]
    fn builder_overrides_defaults() {
        let clock = TestClock::new();
        clock.adjust(Duration::from_secs(3));
        let rt = Runtime::builder()
            .name("pipeline")
            .buffer_size(0)
            .clock(clock)
            .build();
        assert_eq!(rt.name(), "pipeline");
        assert_eq!(rt.buffer_size(), 1);
        assert_eq!(rt.clock().now(), Duration::from_secs(3));

        let rt = Runtime::new();
        assert_eq!(rt.name(), DEFAULT_NAME);
        assert_eq!(rt.buffer_size(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn task_threads_are_named() {
        let rt = Runtime::builder().name("named").build();
        let task = rt.fork::<(), _, _>(|| Ok(std::thread::current().name().map(String::from)));
        let name = task.join().unwrap().unwrap();
        assert!(name.starts_with("named-"), "{name}");
    }

    #[test]
    fn scoped_tears_down_forked_tasks() {
        let rt = Runtime::new();
        let task = rt.scoped(|ctx| {
            ctx.fork::<(), (), _>(|| {
                let _ = signal().recv();
                Ok(())
            })
        });
        assert!(task.is_finished());
    }

    #[test]
    fn waited_task_leaves_scope() {
        let rt = Runtime::new();
        rt.scoped(|ctx| {
            let child = ctx.child();
            let task = child.fork::<(), _, _>(|| Ok(1));
            assert_eq!(task.join(), Ok(1));
            assert_eq!(child.scope().finalizer_count(), 0);
        });
    }
}
