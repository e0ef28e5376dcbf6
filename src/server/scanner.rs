//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Server-side cursors: a registered engine scanner plus its schema, with a
//! bounded-limit adapter for max-rows scans.

use crate::engine::{DataScanner, EngineError};
use crate::model::Tuple;

// ---------------------------------------------------------------------------
// Bounded-limit adapter
// ---------------------------------------------------------------------------

/// Caps an engine scanner at `max_rows` rows.
pub struct LimitedScanner {
    inner: Box<dyn DataScanner>,
    remaining: u64,
}

impl LimitedScanner {
    pub fn new(inner: Box<dyn DataScanner>, max_rows: u64) -> LimitedScanner {
        LimitedScanner {
            inner,
            remaining: max_rows,
        }
    }
}

impl DataScanner for LimitedScanner {
    fn schema(&self) -> &[String] {
        self.inner.schema()
    }

    fn next_row(&mut self) -> Result<Option<Tuple>, EngineError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.inner.next_row()? {
            Some(row) => {
                self.remaining -= 1;
                Ok(Some(row))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.remaining == 0 || self.inner.is_finished()
    }

    fn close(&mut self) {
        self.remaining = 0;
        self.inner.close();
    }
}

// ---------------------------------------------------------------------------
// Server-side cursor
// ---------------------------------------------------------------------------

/// A cursor owned by the session that opened it; the client-chosen id is a
/// lookup key only.
pub struct ServerSideScanner {
    id: String,
    schema: Vec<String>,
    scanner: Box<dyn DataScanner>,
}

impl ServerSideScanner {
    pub fn new(id: &str, scanner: Box<dyn DataScanner>, max_rows: u64) -> ServerSideScanner {
        let scanner: Box<dyn DataScanner> = if max_rows > 0 {
            Box::new(LimitedScanner::new(scanner, max_rows))
        } else {
            scanner
        };
        let schema = scanner.schema().to_vec();
        ServerSideScanner {
            id: id.to_string(),
            schema,
            scanner,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    /// Consume up to `fetch_size` rows.
    pub fn fetch(&mut self, fetch_size: usize) -> Result<Vec<Tuple>, EngineError> {
        let mut rows = Vec::with_capacity(fetch_size.min(64));
        while rows.len() < fetch_size {
            match self.scanner.next_row()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub fn is_finished(&self) -> bool {
        self.scanner.is_finished()
    }

    /// Client-close hook: releases the engine scanner.
    pub fn close(&mut self) {
        self.scanner.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SqlValue;
    use std::sync::Arc;

    struct VecScanner {
        fields: Vec<String>,
        rows: Vec<Tuple>,
        pos: usize,
        closed: bool,
    }

    impl VecScanner {
        fn of(n: usize) -> VecScanner {
            let fields = vec!["a".to_string()];
            let shared = Arc::new(fields.clone());
            let rows = (0..n)
                .map(|i| Tuple::new(shared.clone(), vec![SqlValue::Long(i as i64)]))
                .collect();
            VecScanner {
                fields,
                rows,
                pos: 0,
                closed: false,
            }
        }
    }

    impl DataScanner for VecScanner {
        fn schema(&self) -> &[String] {
            &self.fields
        }

        fn next_row(&mut self) -> Result<Option<Tuple>, EngineError> {
            match self.rows.get(self.pos) {
                Some(row) => {
                    self.pos += 1;
                    Ok(Some(row.clone()))
                }
                None => Ok(None),
            }
        }

        fn is_finished(&self) -> bool {
            self.pos >= self.rows.len()
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn fetch_in_chunks_until_finished() {
        let mut s = ServerSideScanner::new("s1", Box::new(VecScanner::of(5)), 0);
        assert_eq!(s.fetch(2).unwrap().len(), 2);
        assert!(!s.is_finished());
        assert_eq!(s.fetch(2).unwrap().len(), 2);
        assert!(!s.is_finished());
        assert_eq!(s.fetch(2).unwrap().len(), 1);
        assert!(s.is_finished());
    }

    #[test]
    fn empty_scan_is_finished_immediately() {
        let mut s = ServerSideScanner::new("s1", Box::new(VecScanner::of(0)), 0);
        assert_eq!(s.fetch(10).unwrap().len(), 0);
        assert!(s.is_finished());
    }

    #[test]
    fn limited_scanner_caps_rows() {
        let mut s = ServerSideScanner::new("s1", Box::new(VecScanner::of(10)), 3);
        assert_eq!(s.fetch(2).unwrap().len(), 2);
        assert!(!s.is_finished());
        assert_eq!(s.fetch(5).unwrap().len(), 1);
        assert!(s.is_finished());
        assert_eq!(s.fetch(5).unwrap().len(), 0);
    }

    #[test]
    fn exact_boundary_reports_finished() {
        let mut s = ServerSideScanner::new("s1", Box::new(VecScanner::of(4)), 0);
        assert_eq!(s.fetch(4).unwrap().len(), 4);
        assert!(s.is_finished());
    }
}
