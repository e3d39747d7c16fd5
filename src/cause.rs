//! Why a stream stopped abnormally.

use std::{any::Any, error::Error, fmt, sync::Arc};

use crate::task::TaskId;

/// The result of running a stream or a task to completion.
pub type Exit<E, A> = Result<A, Cause<E>>;

/// An unexpected failure, usually a panic caught inside user code.
#[derive(Clone, PartialEq, Eq)]
pub struct Defect(Arc<str>);

impl Defect {
    /// Creates a defect carrying `message`.
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self(message.into().into())
    }

    /// Extracts the message of a panic payload, as returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&'static str>() {
            Self::new(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::new(s.as_str())
        } else {
            Self::new("<non-string panic payload>")
        }
    }

    /// The panic message, or whatever the defect was created with.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&self.message()).finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl Error for Defect {}

/// A tree of failures.
///
/// Typed failures ([`Cause::Fail`]), defects ([`Cause::Die`]) and interruptions
/// ([`Cause::Interrupt`]) are kept apart, so that recovery code for expected errors never
/// swallows a panic or a cancellation. Failures observed one after another are joined with
/// [`Cause::Sequential`], failures of concurrently running producers with [`Cause::Parallel`].
#[derive(Clone, Debug, PartialEq)]
pub enum Cause<E> {
    Empty,
    Fail(E),
    Die(Defect),
    /// Carries the id of the task that requested the interruption.
    Interrupt(TaskId),
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect with the given message.
    pub fn die<M: Into<String>>(message: M) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// An interruption requested by task `by`.
    pub fn interrupt(by: TaskId) -> Self {
        Cause::Interrupt(by)
    }

    /// `self` followed by `next`. [`Cause::Empty`] on either side is dropped.
    pub fn sequential(self, next: Cause<E>) -> Self {
        match (self, next) {
            (Cause::Empty, c) | (c, Cause::Empty) => c,
            (a, b) => Cause::Sequential(Box::new(a), Box::new(b)),
        }
    }

    /// `self` alongside `other`. [`Cause::Empty`] on either side is dropped.
    pub fn parallel(self, other: Cause<E>) -> Self {
        match (self, other) {
            (Cause::Empty, c) | (c, Cause::Empty) => c,
            (a, b) => Cause::Parallel(Box::new(a), Box::new(b)),
        }
    }

    /// Returns `true` if nothing at all is recorded in the cause.
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => false,
            Cause::Sequential(a, b) | Cause::Parallel(a, b) => a.is_empty() && b.is_empty(),
        }
    }

    fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Cause<E>)) {
        match self {
            Cause::Sequential(a, b) | Cause::Parallel(a, b) => {
                a.walk(visit);
                b.walk(visit);
            }
            leaf => visit(leaf),
        }
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Fail(e) = c {
                out.push(e);
            }
        });
        out
    }

    /// Every defect in the cause, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Die(d) = c {
                out.push(d);
            }
        });
        out
    }

    /// The ids of every task that requested an interruption recorded in the cause.
    pub fn interruptors(&self) -> Vec<TaskId> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Interrupt(id) = c {
                out.push(*id);
            }
        });
        out
    }

    /// Returns `true` if the cause contains interruptions and nothing else.
    pub fn is_interrupted_only(&self) -> bool {
        let mut interrupted = false;
        let mut other = false;
        self.walk(&mut |c| match c {
            Cause::Interrupt(_) => interrupted = true,
            Cause::Empty => {}
            _ => other = true,
        });
        interrupted && !other
    }

    /// Maps every typed failure, keeping the shape of the tree.
    pub fn map<E2, F: FnMut(E) -> E2>(self, mut f: F) -> Cause<E2> {
        self.map_inner(&mut f)
    }

    fn map_inner<E2, F: FnMut(E) -> E2>(self, f: &mut F) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(a, b) => {
                Cause::Sequential(Box::new((*a).map_inner(f)), Box::new((*b).map_inner(f)))
            }
            Cause::Parallel(a, b) => {
                Cause::Parallel(Box::new((*a).map_inner(f)), Box::new((*b).map_inner(f)))
            }
        }
    }

    /// Drops all typed failures, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        match self {
            Cause::Empty | Cause::Fail(_) => Cause::Empty,
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(a, b) => (*a).strip_failures().sequential((*b).strip_failures()),
            Cause::Parallel(a, b) => (*a).strip_failures().parallel((*b).strip_failures()),
        }
    }

    /// Returns the first typed failure, or the whole cause if there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        match self {
            Cause::Fail(e) => Ok(e),
            Cause::Sequential(a, b) | Cause::Parallel(a, b) => match (*a).failure_or_cause() {
                Ok(e) => Ok(e),
                Err(a) => match (*b).failure_or_cause() {
                    Ok(e) => Ok(e),
                    Err(b) => Err(Cause::Parallel(Box::new(a), Box::new(b))),
                },
            },
            other => Err(other),
        }
    }

    /// Returns the first typed failure.
    ///
    /// # Panics
    ///
    /// Panics if the cause contains no typed failure, i.e. if execution ended because of a defect
    /// or an interruption. This keeps `Result`-based error handling from observing either.
    pub fn squash(self) -> E {
        match self.failure_or_cause() {
            Ok(e) => e,
            Err(cause) => {
                if let Some(defect) = cause.defects().first() {
                    panic!("stream died: {defect}");
                }
                match cause.interruptors().first() {
                    Some(id) => panic!("stream interrupted by task {id}"),
                    None => panic!("stream failed with an empty cause"),
                }
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => f.write_str("<empty>"),
            Cause::Fail(e) => write!(f, "failure: {e}"),
            Cause::Die(d) => write!(f, "defect: {d}"),
            Cause::Interrupt(id) => write!(f, "interrupted by task {id}"),
            Cause::Sequential(a, b) => write!(f, "({a}) then ({b})"),
            Cause::Parallel(a, b) => write!(f, "({a}) alongside ({b})"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> Error for Cause<E> {}
