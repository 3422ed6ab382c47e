//! Value access with permission polling.
//!
//! The broker only answers whether an access is permitted right now. A
//! reader or writer that is refused polls again after a short pause until
//! it is let through or its timeout runs out, then performs the access and
//! reports it with `set_state`.

use super::stub::SvpClient;
use crate::config::AccessConfig;
use crate::svar::{SvarKey, SvarState};
use crate::{Result, SvpError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// The record operations a value access needs.
#[async_trait]
pub trait SvarAccess: Send + Sync {
    async fn may_use(&self, key: SvarKey, attempt: u32) -> Result<bool>;
    async fn may_set(&self, key: SvarKey, attempt: u32) -> Result<bool>;
    async fn get_value(&self, key: SvarKey) -> Result<Vec<u8>>;
    async fn assign_value(&self, key: SvarKey, payload: Vec<u8>) -> Result<()>;
    async fn set_state(&self, key: SvarKey, used: bool) -> Result<SvarState>;
}

#[async_trait]
impl SvarAccess for SvpClient {
    async fn may_use(&self, key: SvarKey, attempt: u32) -> Result<bool> {
        SvpClient::may_use(self, key, attempt).await
    }

    async fn may_set(&self, key: SvarKey, attempt: u32) -> Result<bool> {
        SvpClient::may_set(self, key, attempt).await
    }

    async fn get_value(&self, key: SvarKey) -> Result<Vec<u8>> {
        SvpClient::get_value(self, key).await
    }

    async fn assign_value(&self, key: SvarKey, payload: Vec<u8>) -> Result<()> {
        SvpClient::assign_value(self, key, payload).await
    }

    async fn set_state(&self, key: SvarKey, used: bool) -> Result<SvarState> {
        SvpClient::set_state(self, key, used).await
    }
}

/// How long and how often to poll.
#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            timeout: AccessConfig::DEFAULT_TIMEOUT,
            poll_interval: AccessConfig::POLL_INTERVAL,
        }
    }
}

impl AccessPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Use,
    Set,
}

async fn wait_for<A: SvarAccess + ?Sized>(
    access: &A,
    key: SvarKey,
    what: Access,
    policy: &AccessPolicy,
) -> Result<()> {
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;
    loop {
        let permitted = match what {
            Access::Use => access.may_use(key, attempt).await?,
            Access::Set => access.may_set(key, attempt).await?,
        };
        if permitted {
            if attempt > 0 {
                debug!("{:?} of {} permitted after {} attempts", what, key, attempt);
            }
            return Ok(());
        }

        attempt += 1;
        if attempt == AccessConfig::LOG_AFTER_ATTEMPTS {
            info!("Still waiting for {:?} access to {}", what, key);
        }
        if Instant::now() >= deadline {
            return Err(SvpError::AccessTimeout {
                key: key.0,
                timeout: policy.timeout,
            });
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}

/// Read the value of `key` once reading is permitted.
pub async fn read_value<A: SvarAccess + ?Sized>(
    access: &A,
    key: SvarKey,
    policy: &AccessPolicy,
) -> Result<Vec<u8>> {
    wait_for(access, key, Access::Use, policy).await?;
    let value = access.get_value(key).await?;
    access.set_state(key, true).await?;
    Ok(value)
}

/// Assign `payload` to `key` once writing is permitted.
pub async fn write_value<A: SvarAccess + ?Sized>(
    access: &A,
    key: SvarKey,
    payload: Vec<u8>,
    policy: &AccessPolicy,
) -> Result<()> {
    wait_for(access, key, Access::Set, policy).await?;
    access.assign_value(key, payload).await?;
    access.set_state(key, false).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Refuses the first `refusals` permission checks.
    struct Gate {
        refusals: Mutex<u32>,
        checks: Mutex<Vec<u32>>,
        value: Mutex<Option<Vec<u8>>>,
        states: Mutex<Vec<bool>>,
    }

    impl Gate {
        fn new(refusals: u32) -> Self {
            Self {
                refusals: Mutex::new(refusals),
                checks: Mutex::new(Vec::new()),
                value: Mutex::new(Some(b"42".to_vec())),
                states: Mutex::new(Vec::new()),
            }
        }

        fn check(&self, attempt: u32) -> bool {
            self.checks.lock().unwrap().push(attempt);
            let mut refusals = self.refusals.lock().unwrap();
            if *refusals == 0 {
                return true;
            }
            *refusals -= 1;
            false
        }
    }

    #[async_trait]
    impl SvarAccess for Gate {
        async fn may_use(&self, _key: SvarKey, attempt: u32) -> Result<bool> {
            Ok(self.check(attempt))
        }

        async fn may_set(&self, _key: SvarKey, attempt: u32) -> Result<bool> {
            Ok(self.check(attempt))
        }

        async fn get_value(&self, key: SvarKey) -> Result<Vec<u8>> {
            self.value
                .lock()
                .unwrap()
                .clone()
                .ok_or(SvpError::NoValue(key.0))
        }

        async fn assign_value(&self, _key: SvarKey, payload: Vec<u8>) -> Result<()> {
            *self.value.lock().unwrap() = Some(payload);
            Ok(())
        }

        async fn set_state(&self, _key: SvarKey, used: bool) -> Result<SvarState> {
            self.states.lock().unwrap().push(used);
            Ok(SvarState::Idle)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_polls_until_permitted() {
        let gate = Gate::new(3);
        let value = read_value(&gate, SvarKey(1), &AccessPolicy::default())
            .await
            .unwrap();
        assert_eq!(value, b"42");
        assert_eq!(*gate.checks.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(*gate.states.lock().unwrap(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_reports_set() {
        let gate = Gate::new(0);
        write_value(&gate, SvarKey(1), b"7".to_vec(), &AccessPolicy::default())
            .await
            .unwrap();
        assert_eq!(gate.value.lock().unwrap().as_deref(), Some(&b"7"[..]));
        assert_eq!(*gate.states.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_times_out() {
        let gate = Gate::new(u32::MAX);
        let policy = AccessPolicy::with_timeout(Duration::from_millis(500));
        let err = read_value(&gate, SvarKey(9), &policy).await.unwrap_err();

        assert!(matches!(err, SvpError::AccessTimeout { key: 9, .. }));
        assert!(err.is_retryable());
        // nothing was read, so nothing was reported
        assert!(gate.states.lock().unwrap().is_empty());
    }
}
