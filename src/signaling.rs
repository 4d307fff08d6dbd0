//! Per-viewer offer/answer state machine
//!
//! ```text
//! New --offer--> Negotiating --answer sent--> Established
//!  |                 |                            |
//!  +-----------------+------ failure / close -----+--> Closed
//! ```
//!
//! One negotiation is attempted per session. A later offer is refused with
//! [`SignalingError::AlreadyNegotiated`] and never produces a second answer.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::codec::{self, SdpType, SessionDescription};
use crate::error::SignalingError;
use crate::model::media::TrackBinding;
use crate::model::packet::ProtocolPacket;
use crate::model::session::SignalingState;
use crate::transport::Negotiator;

/// What a successful offer yields: the packet to send back and the transport
/// that now carries the viewer's media.
pub struct Established<T> {
    pub answer: ProtocolPacket,
    pub transport: T,
}

pub struct SignalingEngine<N: Negotiator> {
    negotiator: Arc<N>,
    binding: TrackBinding,
    state: watch::Sender<SignalingState>,
}

impl<N: Negotiator> SignalingEngine<N> {
    pub fn new(negotiator: Arc<N>, binding: TrackBinding) -> SignalingEngine<N> {
        let (state, _) = watch::channel(SignalingState::New);
        SignalingEngine {
            negotiator,
            binding,
            state,
        }
    }

    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SignalingState> {
        self.state.subscribe()
    }

    /// Handle the encoded payload of an `OFFER` packet.
    pub fn handle_offer(
        &mut self,
        payload: &str,
    ) -> Result<Established<N::Transport>, SignalingError> {
        match self.state() {
            SignalingState::New => {}
            SignalingState::Negotiating | SignalingState::Established => {
                return Err(SignalingError::AlreadyNegotiated)
            }
            SignalingState::Closed => return Err(SignalingError::NegotiationClosed),
        }

        self.set_state(SignalingState::Negotiating);

        match self.negotiate(payload) {
            Ok(established) => {
                self.set_state(SignalingState::Established);
                Ok(established)
            }
            Err(e) => {
                warn!("Negotiation failed: {e}");
                self.set_state(e.next_state());
                Err(e)
            }
        }
    }

    fn negotiate(&self, payload: &str) -> Result<Established<N::Transport>, SignalingError> {
        let offer: SessionDescription = codec::decode(payload)?;
        if offer.kind != SdpType::Offer {
            return Err(SignalingError::UnexpectedDescription(format!("{:?}", offer.kind)));
        }

        let negotiated = self.negotiator.negotiate(&offer, self.binding)?;
        let answer = ProtocolPacket::answer(codec::encode(&negotiated.answer)?);

        info!(stream = %self.binding.stream_id, "Answer ready");

        Ok(Established {
            answer,
            transport: negotiated.transport,
        })
    }

    pub fn close(&mut self) {
        self.set_state(SignalingState::Closed);
    }

    fn set_state(&self, next: SignalingState) {
        self.state.send_replace(next);
    }
}
