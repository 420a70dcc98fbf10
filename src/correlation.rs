//! Keyed table of operations waiting for an asynchronous confirmation or response.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use anyhow::Result;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::error::AfError;

/// Identity of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    DataConfirm {
        endpoint: u8,
        trans_id: u8,
    },
    ReflectError {
        endpoint: u8,
        trans_id: u8,
    },
    /// `src_endpoint` is absent for self-addressed exchanges
    ZclIncoming {
        addr: u16,
        endpoint: u8,
        src_endpoint: Option<u8>,
        seq: u8,
    },
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::DataConfirm { endpoint, trans_id } => {
                write!(f, "AF:dataConfirm:{}:{}", endpoint, trans_id)
            }
            CorrelationKey::ReflectError { endpoint, trans_id } => {
                write!(f, "AF:reflectError:{}:{}", endpoint, trans_id)
            }
            CorrelationKey::ZclIncoming {
                addr,
                endpoint,
                src_endpoint: Some(src),
                seq,
            } => write!(f, "ZCL:incomingMsg:{}:{}:{}:{}", addr, endpoint, src, seq),
            CorrelationKey::ZclIncoming {
                addr,
                endpoint,
                src_endpoint: None,
                seq,
            } => write!(f, "ZCL:incomingMsg:{}:{}:{}", addr, endpoint, seq),
        }
    }
}

/// Hook run on a delivered value before the waiter sees it. It may turn the value into an error.
pub type PreResolve<T> = Box<dyn FnOnce(T) -> Result<T> + Send>;

struct PendingOperation<T> {
    id: u64,
    sink: oneshot::Sender<Result<T>>,
    pre_resolve: Option<PreResolve<T>>,
    expiry: AbortHandle,
}

struct RegistryInner<T> {
    pending: HashMap<CorrelationKey, PendingOperation<T>>,
    next_id: u64,
}

pub struct CorrelationRegistry<T> {
    inner: Arc<Mutex<RegistryInner<T>>>,
    default_timeout: Duration,
}

/// Receiving half of a registered operation.
pub struct PendingReply<T> {
    key: CorrelationKey,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingReply<T> {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub async fn recv(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(AfError::Dropped(self.key.to_string()).into()),
        }
    }
}

fn lock<T>(inner: &Mutex<RegistryInner<T>>) -> MutexGuard<'_, RegistryInner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> CorrelationRegistry<T> {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                pending: HashMap::new(),
                next_id: 0,
            })),
            default_timeout,
        }
    }

    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        lock(&self.inner).pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a pending operation. Must be called from within a tokio runtime,
    /// the expiry timer runs as a task.
    pub fn register(
        &self,
        key: CorrelationKey,
        pre_resolve: Option<PreResolve<T>>,
        timeout: Option<Duration>,
    ) -> Result<PendingReply<T>> {
        let mut inner = lock(&self.inner);
        if inner.pending.contains_key(&key) {
            return Err(AfError::KeyInUse(key.to_string()).into());
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let weak = Arc::downgrade(&self.inner);
        let expiry_key = key.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(weak, expiry_key, id);
        })
        .abort_handle();

        let (sink, rx) = oneshot::channel();
        inner.pending.insert(
            key.clone(),
            PendingOperation {
                id,
                sink,
                pre_resolve,
                expiry,
            },
        );
        log::trace!("registered {} timeout:{:?}", key, timeout);
        Ok(PendingReply { key, rx })
    }

    fn take(&self, key: &CorrelationKey) -> Option<PendingOperation<T>> {
        let op = lock(&self.inner).pending.remove(key)?;
        op.expiry.abort();
        Some(op)
    }

    /// Settle with `value`, bypassing the pre-resolve hook. No-op if `key` is not pending.
    pub fn resolve(&self, key: &CorrelationKey, value: T) -> bool {
        match self.take(key) {
            Some(op) => {
                log::trace!("resolved {}", key);
                let _ = op.sink.send(Ok(value));
                true
            }
            None => false,
        }
    }

    pub fn reject(&self, key: &CorrelationKey, err: anyhow::Error) -> bool {
        match self.take(key) {
            Some(op) => {
                log::debug!("rejected {}: {:#}", key, err);
                let _ = op.sink.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Hand an inbound event to the operation, running its pre-resolve hook first.
    pub fn deliver(&self, key: &CorrelationKey, value: T) -> bool {
        match self.take(key) {
            Some(op) => {
                let result = match op.pre_resolve {
                    Some(hook) => hook(value),
                    None => Ok(value),
                };
                if let Err(e) = &result {
                    log::debug!("delivery to {} failed: {:#}", key, e);
                }
                let _ = op.sink.send(result);
                true
            }
            None => false,
        }
    }
}

fn expire<T>(inner: Weak<Mutex<RegistryInner<T>>>, key: CorrelationKey, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let op = {
        let mut inner = lock(&inner);
        match inner.pending.get(&key) {
            Some(op) if op.id == id => inner.pending.remove(&key),
            _ => None,
        }
    };
    if let Some(op) = op {
        log::debug!("{} timed out", key);
        let _ = op.sink.send(Err(AfError::Timeout {
            label: key.to_string(),
        }
        .into()));
    }
}
