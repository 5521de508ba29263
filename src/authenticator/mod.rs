//! Client-side authentication methods.
//!
//! An [`Authenticator`] prepares the method and options for the Hello
//! message and arranges for the server's challenge to reach the `notify`
//! channel, either through its own side channel (path reflection) or from the
//! control connection itself (direct).

mod direct;
mod path_reflection;
mod raw;

pub use direct::DirectAuth;
pub use path_reflection::{
    extract_token, PathReflectionAuth, IP_LOCAL_PORT_HIGH, IP_LOCAL_PORT_LOW, REFLECTOR_PORT,
};
pub use raw::{PnetDialer, PnetTcpConnection, RawConnection, RawDialer};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::Result, protocol::AuthenticationMethod};

/// Channel that delivers the received challenge, or an empty string on failure.
pub type ChallengeSender = mpsc::Sender<String>;

/// A specific way of proving ownership of the claimed address.
#[async_trait]
pub trait Authenticator: Send {
    /// Starts an attempt and returns the Hello method and options.
    ///
    /// At most one challenge is ever sent on `notify` per attempt.
    async fn authenticate(
        &mut self,
        notify: ChallengeSender,
    ) -> Result<(AuthenticationMethod, Vec<u8>)>;
}
