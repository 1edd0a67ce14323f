use serde::Deserialize;
use std::{net::Ipv4Addr, time::Duration};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument};

use crate::{
    configure::{ApiCall, ConfigurationError, put_checked},
    models::{ActionType, InstanceActionSpec},
    net::GuestMac,
    paths::ApiPaths,
    session::ApiSession,
};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Policy(#[from] ReadinessPolicyError),

    #[error(
        "action {action_id} was not confirmed within {waited:?} ({attempts} attempts, last status {last_status})"
    )]
    Timeout {
        action_id: String,
        waited: Duration,
        attempts: u32,
        last_status: u16,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPolicyError {
    #[error("backoff initial_delay must be greater than zero")]
    ZeroInitialDelay,

    #[error("backoff max_delay {max_delay:?} is below initial_delay {initial_delay:?}")]
    MaxBelowInitial {
        initial_delay: Duration,
        max_delay: Duration,
    },
}

/// How to wait for a start action to be confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawReadinessPolicy")]
pub enum ReadinessPolicy {
    /// Sleep once, then require a single good status check.
    FixedDelay { delay: Duration },
    /// Poll the action, doubling the pause between attempts up to
    /// `max_delay`, until it is confirmed or `timeout` has passed.
    Backoff {
        initial_delay: Duration,
        max_delay: Duration,
        timeout: Duration,
    },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawReadinessPolicy {
    FixedDelay {
        #[serde(deserialize_with = "crate::duration::deserialize")]
        delay: Duration,
    },
    Backoff {
        #[serde(deserialize_with = "crate::duration::deserialize")]
        initial_delay: Duration,
        #[serde(deserialize_with = "crate::duration::deserialize")]
        max_delay: Duration,
        #[serde(deserialize_with = "crate::duration::deserialize")]
        timeout: Duration,
    },
}

impl TryFrom<RawReadinessPolicy> for ReadinessPolicy {
    type Error = ReadinessPolicyError;

    fn try_from(raw: RawReadinessPolicy) -> Result<Self, Self::Error> {
        let policy = match raw {
            RawReadinessPolicy::FixedDelay { delay } => ReadinessPolicy::FixedDelay { delay },
            RawReadinessPolicy::Backoff {
                initial_delay,
                max_delay,
                timeout,
            } => ReadinessPolicy::Backoff {
                initial_delay,
                max_delay,
                timeout,
            },
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl ReadinessPolicy {
    /// A backoff must make progress between polls and its ceiling must
    /// not undercut its first pause.
    pub fn validate(&self) -> Result<(), ReadinessPolicyError> {
        match *self {
            ReadinessPolicy::FixedDelay { .. } => Ok(()),
            ReadinessPolicy::Backoff {
                initial_delay,
                max_delay,
                ..
            } => {
                if initial_delay.is_zero() {
                    Err(ReadinessPolicyError::ZeroInitialDelay)
                } else if max_delay < initial_delay {
                    Err(ReadinessPolicyError::MaxBelowInitial {
                        initial_delay,
                        max_delay,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy::Backoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Starts a configured instance and waits for the start to be confirmed.
pub struct InstanceLifecycle<'a, S: ApiSession + ?Sized> {
    session: &'a S,
    paths: &'a ApiPaths,
    guest_mac: GuestMac,
}

impl<'a, S: ApiSession + ?Sized> InstanceLifecycle<'a, S> {
    pub fn new(session: &'a S, paths: &'a ApiPaths, guest_mac: GuestMac) -> Self {
        Self {
            session,
            paths,
            guest_mac,
        }
    }

    /// Address the guest will answer on, derived from its MAC.
    pub fn address(&self) -> Ipv4Addr {
        self.guest_mac.guest_ip()
    }

    /// Ask the API to start the instance. Returns once the request is
    /// accepted, not once the guest is up.
    #[instrument(skip(self))]
    pub async fn start(&self, action_id: &str) -> Result<(), LifecycleError> {
        let action = InstanceActionSpec {
            action_id: action_id.to_owned(),
            action_type: ActionType::InstanceStart,
        };
        let path = self.paths.action(action_id).map_err(ConfigurationError::from)?;
        put_checked(self.session, ApiCall::InstanceStart, &path, &action).await?;
        info!("Instance start accepted");
        Ok(())
    }

    /// Wait until the start action is confirmed. Returns the number of
    /// status checks made.
    #[instrument(skip(self))]
    pub async fn await_ready(
        &self,
        action_id: &str,
        policy: &ReadinessPolicy,
    ) -> Result<u32, LifecycleError> {
        policy.validate()?;
        let path = self.paths.action(action_id).map_err(ConfigurationError::from)?;

        match *policy {
            ReadinessPolicy::FixedDelay { delay } => {
                sleep(delay).await;
                let response = self.session.get(&path).await.map_err(ConfigurationError::from)?;
                if !self.session.is_good_response(response.status) {
                    return Err(ConfigurationError::Rejected {
                        call: ApiCall::ActionStatus,
                        status: response.status,
                        body: response.body,
                    }
                    .into());
                }
                info!("Instance start confirmed");
                Ok(1)
            }
            ReadinessPolicy::Backoff {
                initial_delay,
                max_delay,
                timeout,
            } => {
                let start = Instant::now();
                let mut delay = initial_delay;
                let mut attempts = 0;

                loop {
                    attempts += 1;
                    let response = self.session.get(&path).await.map_err(ConfigurationError::from)?;
                    if self.session.is_good_response(response.status) {
                        info!(attempts, elapsed = ?start.elapsed(), "Instance start confirmed");
                        return Ok(attempts);
                    }
                    debug!(attempts, status = response.status, ?delay, "Start not confirmed yet");

                    if start.elapsed() + delay > timeout {
                        return Err(LifecycleError::Timeout {
                            action_id: action_id.to_owned(),
                            waited: start.elapsed(),
                            attempts,
                            last_status: response.status,
                        });
                    }
                    sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }
}
