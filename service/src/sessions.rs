// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{ErrorCode, ServiceError};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct ReadSession {
    pub path: String,
    pub content: Bytes,
    pub chunk_size: usize,
    last_touched: Instant,
}

impl ReadSession {
    pub fn total_chunks(&self) -> u64 {
        if self.content.is_empty() {
            1
        } else {
            (self.content.len() as u64).div_ceil(self.chunk_size as u64)
        }
    }
}

pub struct WriteSession {
    pub path: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub chunks: HashMap<u64, Bytes>,
    last_touched: Instant,
}

impl WriteSession {
    pub fn expected_chunks(&self) -> u64 {
        if self.total_size == 0 {
            1
        } else {
            self.total_size.div_ceil(self.chunk_size as u64)
        }
    }
}

pub enum Session {
    Read(ReadSession),
    Write(WriteSession),
}

impl Session {
    fn touch(&mut self, now: Instant) {
        match self {
            Session::Read(s) => s.last_touched = now,
            Session::Write(s) => s.last_touched = now,
        }
    }

    fn last_touched(&self) -> Instant {
        match self {
            Session::Read(s) => s.last_touched,
            Session::Write(s) => s.last_touched,
        }
    }
}

///
/// Server-side state for in-flight streaming operations, keyed by opaque ids. Sessions expire
/// after an idle interval; a background sweep reclaims them so an abandoned client cannot pin
/// file content forever.
///
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> SessionRegistry {
        SessionRegistry {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    pub fn open_read(&self, path: String, content: Bytes, chunk_size: usize) -> (String, u64) {
        let session = ReadSession {
            path,
            content,
            chunk_size,
            last_touched: Instant::now(),
        };
        let total_chunks = session.total_chunks();
        let id = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .insert(id.clone(), Session::Read(session));
        (id, total_chunks)
    }

    pub fn open_write(&self, path: String, total_size: u64, chunk_size: usize) -> (String, u64) {
        let session = WriteSession {
            path,
            total_size,
            chunk_size,
            chunks: HashMap::new(),
            last_touched: Instant::now(),
        };
        let expected = session.expected_chunks();
        let id = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .insert(id.clone(), Session::Write(session));
        (id, expected)
    }

    /// Runs `f` against a live session, refreshing its idle clock.
    pub fn with_session<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| ServiceError::invalid_session(id))?;
        let now = Instant::now();
        if now.duration_since(session.last_touched()) > self.idle_timeout {
            sessions.remove(id);
            return Err(ServiceError::invalid_session(id));
        }
        session.touch(now);
        f(session)
    }

    pub fn take(&self, id: &str) -> Result<Session, ServiceError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .remove(id)
            .ok_or_else(|| ServiceError::invalid_session(id))?;
        if Instant::now().duration_since(session.last_touched()) > self.idle_timeout {
            return Err(ServiceError::invalid_session(id));
        }
        Ok(session)
    }

    /// Removes a session regardless of its state. Unknown ids fail with INVALID_SESSION.
    pub fn abort(&self, id: &str) -> Result<(), ServiceError> {
        match self.sessions.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(ServiceError::new(
                ErrorCode::InvalidSession,
                format!("unknown or expired session: {id}"),
            )),
        }
    }

    /// Drops every session idle past the timeout; returns how many were reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_touched()) <= self.idle_timeout);
        let swept = before - sessions.len();
        if swept > 0 {
            debug!("swept {swept} expired streaming sessions");
        }
        swept
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}
