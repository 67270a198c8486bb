//! `webrtc-rs` implementation of the peer seams.
//!
//! Each receiver gets its own `RTCPeerConnection` with one send-only VP9
//! track. Library callbacks only translate their arguments into
//! [`PeerEvent`]s.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_VP9, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::SignalingError;
use crate::stream::peer::{MediaTrack, OpenedPeer, PeerConnector, PeerLink};
use crate::stream::registry::{PeerEvent, PeerEvents};
use crate::stream::types::{GatheringState, PeerState, SessionDescription, VIDEO_CLOCK_RATE};

/// Peer-connection parameters shared by every receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    /// STUN server URLs. Empty means host candidates only.
    pub stun_servers: Vec<String>,
    pub track_id: String,
    pub stream_id: String,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            track_id: "video".into(),
            stream_id: "video-send".into(),
        }
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

fn vp9_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP9.to_owned(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "profile-id=0".to_owned(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "nack".to_owned(),
                parameter: "pli".to_owned(),
            },
            RTCPFeedback {
                typ: "ccm".to_owned(),
                parameter: "fir".to_owned(),
            },
        ],
    }
}

// ── Connector ────────────────────────────────────────────────────

pub struct WebRtcConnector {
    api: API,
    rtc: RTCConfiguration,
    config: RtcConfig,
}

impl WebRtcConnector {
    pub fn new(config: RtcConfig) -> Result<Self, SignalingError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let rtc = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self { api, rtc, config })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, events: PeerEvents) -> Result<OpenedPeer, SignalingError> {
        let client = events.client();
        let pc = Arc::new(self.api.new_peer_connection(self.rtc.clone()).await?);

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let state = PeerState::from(state);
                events.emit(PeerEvent::StateChanged(state));
                if state == PeerState::Connected {
                    events.emit(PeerEvent::TrackOpened);
                }
            })
        }));

        let gathering_events = events.clone();
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let events = gathering_events.clone();
            let pc = weak_pc.clone();
            Box::pin(async move {
                match state {
                    RTCIceGathererState::Gathering => {
                        events.emit(PeerEvent::GatheringChanged(GatheringState::InProgress));
                    }
                    RTCIceGathererState::Complete => {
                        let Some(pc) = pc.upgrade() else { return };
                        match pc.local_description().await {
                            Some(local) => events.emit(PeerEvent::GatheringComplete(
                                SessionDescription::new(local.sdp_type.to_string(), local.sdp),
                            )),
                            None => warn!(client = %events.client(), "gathering complete without local description"),
                        }
                    }
                    other => trace!(client = %events.client(), state = ?other, "gatherer state"),
                }
            })
        }));

        let track = Arc::new(TrackLocalStaticRTP::new(
            vp9_capability(),
            self.config.track_id.clone(),
            self.config.stream_id.clone(),
        ));
        let transceiver = pc
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        let sender = transceiver.sender().await;
        tokio::spawn(read_feedback(sender, events));

        debug!(%client, "peer connection created");
        Ok(OpenedPeer {
            link: Arc::new(WebRtcLink { pc }),
            track: Arc::new(RtpTrack { track }),
        })
    }
}

/// Turn incoming RTCP into keyframe requests; report the track closed when
/// the sender stops.
async fn read_feedback(sender: Arc<RTCRtpSender>, events: PeerEvents) {
    loop {
        match sender.read_rtcp().await {
            Ok((packets, _)) => {
                let wants_keyframe = packets.iter().any(|p| {
                    let any = p.as_any();
                    any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>()
                });
                if wants_keyframe {
                    events.emit(PeerEvent::KeyframeRequested);
                }
            }
            Err(e) => {
                debug!(client = %events.client(), error = %e, "rtcp reader finished");
                events.emit(PeerEvent::TrackClosed);
                return;
            }
        }
    }
}

// ── Link / track ─────────────────────────────────────────────────

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn start_negotiation(&self) -> Result<(), SignalingError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        Ok(())
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SignalingError> {
        let desc = match answer.kind.as_str() {
            "answer" => RTCSessionDescription::answer(answer.sdp.clone()),
            "pranswer" => RTCSessionDescription::pranswer(answer.sdp.clone()),
            other => {
                return Err(SignalingError::MalformedDescription(format!(
                    "expected an answer, got `{other}`"
                )));
            }
        }
        .map_err(|e| SignalingError::MalformedDescription(e.to_string()))?;
        self.pc.set_remote_description(desc).await?;
        info!("remote answer applied");
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "peer connection close failed");
        }
    }
}

struct RtpTrack {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl MediaTrack for RtpTrack {
    async fn write_packet(&self, packet: &[u8]) -> Result<(), SignalingError> {
        self.track.write(packet).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::registry::ReceiverRegistry;
    use crate::stream::types::{ClientId, KeyframeRequest};
    use std::time::Duration;

    #[test]
    fn state_mapping() {
        assert_eq!(PeerState::from(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Unspecified), PeerState::New);
        assert!(PeerState::from(RTCPeerConnectionState::Disconnected).is_terminal());
    }

    #[test]
    fn capability_is_vp9() {
        let codec = vp9_capability();
        assert_eq!(codec.mime_type, MIME_TYPE_VP9);
        assert_eq!(codec.clock_rate, 90_000);
    }

    #[tokio::test]
    async fn offer_is_cached_after_gathering() {
        let registry = crate::stream::testing::live_registry();
        let connector = WebRtcConnector::new(RtcConfig::default()).unwrap();
        let client = ClientId::next();

        let events = registry.events_for(client);
        let peer = connector.open(events.clone()).await.unwrap();
        let link = Arc::clone(&peer.link);
        let pending = registry.insert(&events, peer).unwrap();
        assert!(matches!(
            registry.offer(client),
            Err(SignalingError::OfferNotReady(_))
        ));

        link.start_negotiation().await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), pending.wait())
            .await
            .expect("gathering timed out")
            .unwrap();

        let offer: SessionDescription =
            serde_json::from_str(&registry.offer(client).unwrap()).unwrap();
        assert_eq!(offer.kind, "offer");
        assert!(offer.sdp.contains("VP9"));
        assert!(offer.sdp.contains("sendonly"));

        assert!(registry.remove(client));
    }

    #[tokio::test]
    async fn offer_is_rejected_as_answer() {
        let registry = ReceiverRegistry::new(KeyframeRequest::new());
        let connector = WebRtcConnector::new(RtcConfig::default()).unwrap();
        let peer = connector
            .open(registry.events_for(ClientId::next()))
            .await
            .unwrap();
        let bogus = SessionDescription::new("offer", "v=0\r\n");
        assert!(matches!(
            peer.link.apply_answer(&bogus).await,
            Err(SignalingError::MalformedDescription(_))
        ));
        peer.link.close().await;
    }
}
