//! Policy refresh: compile a declarative document (local file or remote
//! URL) and ask the supervisor to swap the live ruleset map.

use std::path::Path;
use std::time::Duration;

use tracing::debug;
use warden_protocol::error::SandboxErr;

use crate::error::Result;
use crate::error::WardenErr;
use crate::supervisor::AuthToken;
use crate::supervisor::Supervisor;
use crate::util::backoff;

/// Compile the policy at `path`, write the compiled ruleset to a temporary
/// file, and delegate the swap to the supervisor. The temporary file is
/// unlinked whichever way the reload goes.
pub async fn refresh(supervisor: &Supervisor, path: &Path, token: AuthToken<'_>) -> Result<()> {
    let compiled = warden_policy::compile_file(path)?;
    apply_compiled(supervisor, &compiled, token)
}

/// Fetch a policy document from `url` and apply it exactly as [`refresh`].
///
/// Each attempt is bounded by `timeout`; only timeout-class failures are
/// retried, up to `max_retries` additional attempts. Exhausting the
/// attempts raises `Timeout`; any other failure surfaces immediately.
pub async fn refresh_remote(
    supervisor: &Supervisor,
    url: &str,
    token: AuthToken<'_>,
    timeout: Option<Duration>,
    max_retries: u32,
) -> Result<()> {
    let client = reqwest::Client::new();
    let attempts = u64::from(max_retries) + 1;

    for attempt in 1..=attempts {
        match fetch(&client, url, timeout).await {
            Ok(text) => {
                let compiled = warden_policy::compile_str(&text)?;
                return apply_compiled(supervisor, &compiled, token);
            }
            Err(FetchErr::Timeout) => {
                if attempt < attempts {
                    debug!("policy download from {url} timed out (attempt {attempt}); retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                return Err(SandboxErr::Timeout.into());
            }
            Err(FetchErr::Other(err)) => return Err(err),
        }
    }
    unreachable!("refresh_remote loop always returns")
}

fn apply_compiled(
    supervisor: &Supervisor,
    compiled: &warden_policy::CompiledPolicy,
    token: AuthToken<'_>,
) -> Result<()> {
    // NamedTempFile unlinks on drop, success or failure alike.
    let tmp = tempfile::NamedTempFile::new()?;
    serde_json::to_writer(tmp.as_file(), compiled)?;
    supervisor.reload_policy(tmp.path(), token)
}

enum FetchErr {
    Timeout,
    Other(WardenErr),
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    timeout: Option<Duration>,
) -> std::result::Result<String, FetchErr> {
    let request = async {
        client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    };
    let response = match timeout {
        Some(limit) => match tokio::time::timeout(limit, request).await {
            Ok(response) => response,
            Err(_) => return Err(FetchErr::Timeout),
        },
        None => request.await,
    };
    match response {
        Ok(text) => Ok(text),
        Err(err) if err.is_timeout() => Err(FetchErr::Timeout),
        Err(err) => Err(FetchErr::Other(err.into())),
    }
}
