//! Batch window policies
//!
//! A policy decides what a window emits. The stage calls its hooks in a fixed
//! order per element: `first` (first element of a window, when enabled),
//! `next` (every element, when enabled), `flush` (window closed).

use std::mem;

use contracts::BoxError;

/// Outputs produced by one hook invocation
#[derive(Debug)]
pub struct Outbox<V> {
    items: Vec<V>,
}

impl<V> Default for Outbox<V> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<V> Outbox<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `value` downstream
    pub fn push(&mut self, value: V) {
        self.items.push(value);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, V> {
        self.items.drain(..)
    }
}

/// Window hooks; every hook defaults to a no-op
pub trait BatchCallbacks<T>: Send + 'static {
    /// Element type emitted downstream
    type Output: Send + 'static;

    /// First element of a window
    fn first(&mut self, _value: &T, _out: &mut Outbox<Self::Output>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Every element
    fn next(&mut self, _value: &T, _out: &mut Outbox<Self::Output>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Window closed; `value` is the element that filled it, `None` on timeout or completion
    fn flush(
        &mut self,
        _value: Option<&T>,
        _out: &mut Outbox<Self::Output>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Upstream elements to request for `n` downstream outputs
    fn upstream_demand(&self, n: u64, batch_size: usize) -> u64 {
        n.saturating_mul(batch_size as u64)
    }
}

/// Collects each window into a `Vec`
#[derive(Debug)]
pub struct Buffer<T> {
    items: Vec<T>,
    batch_size: usize,
}

impl<T> Buffer<T> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: Vec::with_capacity(batch_size),
            batch_size,
        }
    }
}

impl<T: Clone + Send + 'static> BatchCallbacks<T> for Buffer<T> {
    type Output = Vec<T>;

    fn next(&mut self, value: &T, _out: &mut Outbox<Vec<T>>) -> Result<(), BoxError> {
        self.items.push(value.clone());
        Ok(())
    }

    fn flush(&mut self, _value: Option<&T>, out: &mut Outbox<Vec<T>>) -> Result<(), BoxError> {
        if !self.items.is_empty() {
            let window = mem::replace(&mut self.items, Vec::with_capacity(self.batch_size));
            out.push(window);
        }
        Ok(())
    }
}

/// Emits the first element of each window
#[derive(Debug, Default)]
pub struct FirstOfWindow;

impl<T: Clone + Send + 'static> BatchCallbacks<T> for FirstOfWindow {
    type Output = T;

    fn first(&mut self, value: &T, out: &mut Outbox<T>) -> Result<(), BoxError> {
        out.push(value.clone());
        Ok(())
    }
}

/// Emits the last element of each window
#[derive(Debug)]
pub struct LastOfWindow<T> {
    last: Option<T>,
}

impl<T> Default for LastOfWindow<T> {
    fn default() -> Self {
        Self { last: None }
    }
}

impl<T: Clone + Send + 'static> BatchCallbacks<T> for LastOfWindow<T> {
    type Output = T;

    fn next(&mut self, value: &T, _out: &mut Outbox<T>) -> Result<(), BoxError> {
        self.last = Some(value.clone());
        Ok(())
    }

    fn flush(&mut self, _value: Option<&T>, out: &mut Outbox<T>) -> Result<(), BoxError> {
        if let Some(last) = self.last.take() {
            out.push(last);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_skips_empty_window() {
        let mut buffer = Buffer::new(2);
        let mut out = Outbox::new();
        BatchCallbacks::<u32>::flush(&mut buffer, None, &mut out).unwrap();
        assert!(out.is_empty());

        buffer.next(&1, &mut out).unwrap();
        buffer.next(&2, &mut out).unwrap();
        buffer.flush(Some(&2), &mut out).unwrap();
        assert_eq!(out.drain().collect::<Vec<_>>(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_last_of_window_forgets_after_flush() {
        let mut last = LastOfWindow::default();
        let mut out = Outbox::new();
        last.next(&"a", &mut out).unwrap();
        last.next(&"b", &mut out).unwrap();
        last.flush(None, &mut out).unwrap();
        last.flush(None, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.drain().next(), Some("b"));
    }

    #[test]
    fn test_default_upstream_demand_saturates() {
        let first = FirstOfWindow;
        assert_eq!(BatchCallbacks::<u8>::upstream_demand(&first, 4, 3), 12);
        assert_eq!(
            BatchCallbacks::<u8>::upstream_demand(&first, u64::MAX, 3),
            u64::MAX
        );
    }
}
