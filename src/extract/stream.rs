//! Lazy, paged record streams
//!
//! Extractors produce records page by page through a [`PageSource`]; the
//! [`RecordStream`] iterator buffers one page at a time, collects per-record
//! warnings and turns a mid-stream interruption into a terminal
//! `PartialResult` carrying the number of records already delivered.

use crate::core::cancel::CancelToken;
use crate::core::error::{ExtractionError, Result};
use crate::extract::records::{Domain, RecordWarning};
use log::{debug, warn};
use std::collections::VecDeque;

/// One batch of parsed records
#[derive(Debug)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub warnings: Vec<RecordWarning>,
}

impl<T> Page<T> {
    pub fn new(records: Vec<T>, warnings: Vec<RecordWarning>) -> Self {
        Self { records, warnings }
    }
}

/// Producer of pages; `Ok(None)` ends the stream.
///
/// A page may be empty (every row malformed) without ending the stream.
pub trait PageSource<T>: Send {
    fn next_page(&mut self, cancel: &CancelToken) -> Result<Option<Page<T>>>;
}

type RecordFilter<T> = Box<dyn Fn(&T) -> bool + Send>;

/// Iterator over `Result<T>`; ends after the first error
pub struct RecordStream<T> {
    domain: Domain,
    source: Box<dyn PageSource<T>>,
    filter: Option<RecordFilter<T>>,
    cancel: CancelToken,
    buffer: VecDeque<T>,
    delivered: usize,
    warnings: Vec<RecordWarning>,
    finished: bool,
}

impl<T> RecordStream<T> {
    pub fn new(domain: Domain, source: Box<dyn PageSource<T>>, cancel: CancelToken) -> Self {
        Self {
            domain,
            source,
            filter: None,
            cancel,
            buffer: VecDeque::new(),
            delivered: 0,
            warnings: Vec::new(),
            finished: false,
        }
    }

    /// Only yield records matching `filter`
    pub fn with_filter(mut self, filter: impl Fn(&T) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Records yielded so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Warnings collected so far
    pub fn warnings(&self) -> &[RecordWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<RecordWarning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn absorb(&mut self, page: Page<T>) {
        for warning in page.warnings {
            warn!("{}", warning);
            self.warnings.push(warning);
        }
        match &self.filter {
            Some(filter) => self
                .buffer
                .extend(page.records.into_iter().filter(|r| filter(r))),
            None => self.buffer.extend(page.records),
        }
    }

    fn fail(&mut self, error: ExtractionError) -> ExtractionError {
        self.finished = true;
        self.buffer.clear();
        match error {
            ExtractionError::Cancelled => ExtractionError::Cancelled,
            e if e.is_interruption() => {
                warn!(
                    "{} stream interrupted after {} records: {}",
                    self.domain, self.delivered, e
                );
                ExtractionError::PartialResult {
                    domain: self.domain,
                    delivered: self.delivered,
                    reason: e.to_string(),
                }
            }
            e => e,
        }
    }
}

impl<T> Iterator for RecordStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if self.cancel.is_cancelled() {
                return Some(Err(self.fail(ExtractionError::Cancelled)));
            }

            if let Some(record) = self.buffer.pop_front() {
                self.delivered += 1;
                return Some(Ok(record));
            }

            match self.source.next_page(&self.cancel) {
                Ok(Some(page)) => self.absorb(page),
                Ok(None) => {
                    debug!("{} stream finished: {} records", self.domain, self.delivered);
                    self.finished = true;
                    return None;
                }
                Err(e) => return Some(Err(self.fail(e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields the scripted results in order
    struct Scripted {
        pages: VecDeque<Result<Option<Page<u32>>>>,
    }

    impl PageSource<u32> for Scripted {
        fn next_page(&mut self, _cancel: &CancelToken) -> Result<Option<Page<u32>>> {
            self.pages.pop_front().unwrap_or(Ok(None))
        }
    }

    fn stream(pages: Vec<Result<Option<Page<u32>>>>) -> RecordStream<u32> {
        RecordStream::new(
            Domain::Sms,
            Box::new(Scripted {
                pages: pages.into(),
            }),
            CancelToken::new(),
        )
    }

    #[test]
    fn test_empty_page_does_not_end_stream() {
        let warning = RecordWarning::new(Domain::Sms, "7", "bad date");
        let mut s = stream(vec![
            Ok(Some(Page::new(vec![1, 2], vec![]))),
            Ok(Some(Page::new(vec![], vec![warning]))),
            Ok(Some(Page::new(vec![3], vec![]))),
        ]);
        let records: Vec<u32> = s.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![1, 2, 3]);
        assert_eq!(s.warnings().len(), 1);
        assert!(s.is_finished());
    }

    #[test]
    fn test_interruption_becomes_partial_result() {
        let mut s = stream(vec![
            Ok(Some(Page::new(vec![1, 2, 3], vec![]))),
            Err(ExtractionError::SessionLost("ABC".to_string())),
        ]);
        let results: Vec<Result<u32>> = s.by_ref().collect();
        assert_eq!(results.len(), 4);
        assert_eq!(
            results[3],
            Err(ExtractionError::PartialResult {
                domain: Domain::Sms,
                delivered: 3,
                reason: "Session for device 'ABC' is lost; reconnect required".to_string(),
            })
        );
        assert!(s.next().is_none());
    }

    #[test]
    fn test_refusal_surfaces_as_itself() {
        let denied = ExtractionError::PermissionDenied {
            serial: "ABC".to_string(),
            capability: "READ_SMS".to_string(),
        };
        let results: Vec<Result<u32>> = stream(vec![Err(denied.clone())]).collect();
        assert_eq!(results, vec![Err(denied)]);
    }

    #[test]
    fn test_cancel_between_records() {
        let mut s = stream(vec![Ok(Some(Page::new(vec![1, 2, 3], vec![])))]);
        assert_eq!(s.next(), Some(Ok(1)));
        s.cancel.cancel();
        assert_eq!(s.next(), Some(Err(ExtractionError::Cancelled)));
        assert_eq!(s.next(), None);
        assert_eq!(s.delivered(), 1);
    }

    #[test]
    fn test_filter() {
        let s = stream(vec![Ok(Some(Page::new(vec![1, 2, 3, 4], vec![])))]).with_filter(|n| n % 2 == 0);
        let records: Vec<u32> = s.map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![2, 4]);
    }
}
