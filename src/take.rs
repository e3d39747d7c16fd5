use crate::{pull::PullResult, Cause, Chunk};

/// A materialized pull result that can be sent through a [`Queue`][crate::Queue].
#[derive(Clone, Debug, PartialEq)]
pub enum Take<E, A> {
    Chunk(Chunk<A>),
    End,
    Fail(Cause<E>),
}

impl<E, A> Take<E, A> {
    /// Converts the result of a pull into a message.
    pub fn from_pull(result: PullResult<E, A>) -> Self {
        match result {
            Ok(chunk) => Take::Chunk(chunk),
            Err(None) => Take::End,
            Err(Some(cause)) => Take::Fail(cause),
        }
    }

    /// Converts the message back into a pull result.
    pub fn into_pull(self) -> PullResult<E, A> {
        match self {
            Take::Chunk(chunk) => Ok(chunk),
            Take::End => Err(None),
            Take::Fail(cause) => Err(Some(cause)),
        }
    }

    /// Returns `true` for [`Take::End`] and [`Take::Fail`].
    pub fn is_done(&self) -> bool {
        !matches!(self, Take::Chunk(_))
    }

    /// Maps the elements of a chunk message.
    pub fn map<B, F: FnMut(&A) -> B>(&self, f: F) -> Take<E, B>
    where
        E: Clone,
    {
        match self {
            Take::Chunk(chunk) => Take::Chunk(chunk.map(f)),
            Take::End => Take::End,
            Take::Fail(cause) => Take::Fail(cause.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_results_map_to_takes() {
        let take: Take<(), i32> = Take::from_pull(Ok(Chunk::from_vec(vec![1, 2])));
        assert!(!take.is_done());
        assert_eq!(take.map(|n| n * 2), Take::Chunk(Chunk::from_vec(vec![2, 4])));

        let end: Take<(), i32> = Take::from_pull(Err(None));
        assert!(end.is_done());
        assert_eq!(end.into_pull(), Err(None));

        let fail: Take<&str, i32> = Take::from_pull(Err(Some(Cause::fail("e"))));
        assert_eq!(fail.into_pull(), Err(Some(Cause::fail("e"))));
    }
}
