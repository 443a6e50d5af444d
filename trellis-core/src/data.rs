//! Restartable batch sources.

use crate::error::{RecipeError, Result};
use crate::value::Value;
use std::sync::Arc;

/// Iterator over the batches of one pass.
pub type Batches = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// A lazy, restartable sequence of batches.
///
/// Each call to [`batches`](DataSource::batches) starts a fresh pass. Batch
/// structure is opaque to the loop beyond being a [`Value`].
pub trait DataSource: Send {
    fn batches(&mut self) -> Batches;

    /// Number of batches per pass, when known up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// In-memory list of batches, replayed on every pass.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    items: Arc<Vec<Value>>,
}

impl VecSource {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl DataSource for VecSource {
    fn batches(&mut self) -> Batches {
        let items = Arc::clone(&self.items);
        Box::new((0..items.len()).map(move |i| Ok(items[i].clone())))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

/// `n` placeholder batches `0..n`, for loops that only need a step count.
#[derive(Debug, Clone, Copy)]
pub struct Steps(pub usize);

impl DataSource for Steps {
    fn batches(&mut self) -> Batches {
        Box::new((0..self.0).map(|i| Ok(Value::from(i))))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.0)
    }
}

/// Wraps a closure producing a fresh batch iterator per pass.
pub struct FnSource<F> {
    make: F,
}

impl<F, I> FnSource<F>
where
    F: FnMut() -> I + Send,
    I: Iterator<Item = Result<Value>> + Send + 'static,
{
    pub fn new(make: F) -> Self {
        Self { make }
    }
}

impl<F, I> DataSource for FnSource<F>
where
    F: FnMut() -> I + Send,
    I: Iterator<Item = Result<Value>> + Send + 'static,
{
    fn batches(&mut self) -> Batches {
        Box::new((self.make)())
    }
}

/// Cycles through a source forever, restarting it when a pass ends.
///
/// Errors yielded by the source are passed through, not swallowed. A pass
/// that yields nothing at all is reported as an error instead of spinning.
pub struct Forever<S> {
    source: S,
    current: Option<Batches>,
    yielded_this_pass: bool,
}

impl<S: DataSource> Forever<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            current: None,
            yielded_this_pass: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

impl<S: DataSource> Iterator for Forever<S> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pass = self.current.get_or_insert_with(|| self.source.batches());
            match pass.next() {
                Some(item) => {
                    self.yielded_this_pass = true;
                    return Some(item);
                }
                None => {
                    let empty_pass = !self.yielded_this_pass;
                    self.current = None;
                    self.yielded_this_pass = false;
                    if empty_pass {
                        return Some(Err(RecipeError::data(
                            "cannot cycle over a data source that yields no batches",
                        )));
                    }
                }
            }
        }
    }
}

/// Cycle `source` forever. See [`Forever`].
pub fn forever<S: DataSource>(source: S) -> Forever<S> {
    Forever::new(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_source_restarts() {
        let mut src = VecSource::new(vec![Value::Int(1), Value::Int(2)]);
        let first: Vec<_> = src.batches().map(|b| b.unwrap()).collect();
        let second: Vec<_> = src.batches().map(|b| b.unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(src.len_hint(), Some(2));
    }

    #[test]
    fn test_steps() {
        let mut src = Steps(3);
        let items: Vec<_> = src.batches().map(|b| b.unwrap()).collect();
        assert_eq!(items, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_forever_cycles() {
        let mut f = forever(VecSource::new(vec![Value::Int(1), Value::Int(2)]));
        let items: Vec<_> = f.by_ref().take(5).map(|b| b.unwrap()).collect();
        assert_eq!(
            items,
            vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(1),
                Value::Int(2),
                Value::Int(1)
            ]
        );
    }

    #[test]
    fn test_forever_propagates_errors() {
        let src = FnSource::new(|| {
            vec![Ok(Value::Int(1)), Err(RecipeError::data("corrupt shard"))].into_iter()
        });
        let mut it = forever(src);
        assert!(it.next().unwrap().is_ok());
        let err = it.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("corrupt shard"));
        // Cycling resumes with a fresh pass after the error was reported.
        assert_eq!(it.next().unwrap().unwrap(), Value::Int(1));
    }

    #[test]
    fn test_forever_empty_source_errors() {
        let mut f = forever(VecSource::default());
        assert!(f.next().unwrap().is_err());
        assert!(f.next().unwrap().is_err());
    }
}
