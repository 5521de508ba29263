use async_trait::async_trait;

use super::{Authenticator, ChallengeSender};
use crate::{error::Result, protocol::AuthenticationMethod};

/// Authentication through a live control connection of the destination.
///
/// The server relays the challenge to the destination's own session, so the
/// challenge arrives on the control channel and no side channel is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAuth;

#[async_trait]
impl Authenticator for DirectAuth {
    async fn authenticate(
        &mut self,
        _notify: ChallengeSender,
    ) -> Result<(AuthenticationMethod, Vec<u8>)> {
        Ok((AuthenticationMethod::DirectChannel, Vec::new()))
    }
}
