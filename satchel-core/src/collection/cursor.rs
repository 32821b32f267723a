// satchel-core/src/collection/cursor.rs
//! Lazy result cursor.
//!
//! `find` returns immediately; the full result set is fetched on first
//! consumption and buffered. `close` forbids further iteration.

use crate::document::Document;
use crate::error::{Result, SatchelError};
use futures::future::BoxFuture;
use std::collections::VecDeque;

enum CursorState {
    /// Deferred fetch, not yet awaited
    Pending(BoxFuture<'static, Result<Vec<Document>>>),
    /// Buffered results being drained
    Drained(VecDeque<Document>),
    Closed,
}

pub struct Cursor {
    state: CursorState,
}

impl Cursor {
    /// Cursor over a deferred fetch
    pub(crate) fn new(fetch: BoxFuture<'static, Result<Vec<Document>>>) -> Self {
        Cursor {
            state: CursorState::Pending(fetch),
        }
    }

    /// Cursor over an already materialised result set
    pub(crate) fn ready(docs: Vec<Document>) -> Self {
        Cursor {
            state: CursorState::Drained(VecDeque::from(docs)),
        }
    }

    async fn buffer(&mut self) -> Result<&mut VecDeque<Document>> {
        match &self.state {
            CursorState::Closed => return Err(SatchelError::ClientClosed),
            CursorState::Pending(_) => {
                let CursorState::Pending(fetch) =
                    std::mem::replace(&mut self.state, CursorState::Drained(VecDeque::new()))
                else {
                    unreachable!()
                };
                let docs = fetch.await?;
                self.state = CursorState::Drained(VecDeque::from(docs));
            }
            CursorState::Drained(_) => {}
        }
        match &mut self.state {
            CursorState::Drained(buffer) => Ok(buffer),
            _ => unreachable!(),
        }
    }

    /// Next document, or `None` once drained
    pub async fn next(&mut self) -> Result<Option<Document>> {
        Ok(self.buffer().await?.pop_front())
    }

    /// Are there undrained documents left
    pub async fn has_next(&mut self) -> Result<bool> {
        Ok(!self.buffer().await?.is_empty())
    }

    /// Drain everything that is left
    pub async fn to_array(&mut self) -> Result<Vec<Document>> {
        let buffer = self.buffer().await?;
        Ok(buffer.drain(..).collect())
    }

    /// Close the cursor; any later use raises `client-closed`.
    pub fn close(&mut self) {
        self.state = CursorState::Closed;
    }
}
