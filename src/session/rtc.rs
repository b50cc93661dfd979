//! Media backend on the `webrtc` crate

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::{EngineEvent, EngineEvents, MediaBackend, MediaEngine};
use crate::error::{Error, Result};

/// Default STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const STREAM_ID: &str = "nostr-call";

fn rtc_error(e: webrtc::Error) -> Error {
    Error::Negotiation(e.to_string())
}

/// Outbound audio and video tracks. Capture devices write samples into them.
pub struct LocalTracks {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

pub struct RtcBackend {
    stun_servers: Vec<String>,
}

impl RtcBackend {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    fn build_api(&self) -> Result<API> {
        let mut m = CodecRegistry::default();
        m.register_default_codecs().map_err(rtc_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m).map_err(rtc_error)?;

        Ok(APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build())
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

impl Default for RtcBackend {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl MediaBackend for RtcBackend {
    type Media = LocalTracks;
    type Engine = RtcEngine;

    async fn acquire_media(&self) -> Result<LocalTracks> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            STREAM_ID.to_owned(),
        ));
        debug!("Local audio/video tracks ready");
        Ok(LocalTracks { audio, video })
    }

    fn release_media(&self, media: LocalTracks) {
        debug!("Releasing local tracks");
        drop(media);
    }

    async fn create_engine(&self, media: &LocalTracks, events: EngineEvents) -> Result<RtcEngine> {
        let api = self.build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(rtc_error)?,
        );

        for track in [&media.audio, &media.video] {
            let track: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(track) as _;
            pc.add_track(track).await.map_err(rtc_error)?;
        }

        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    if let Ok(init) = c.to_json() {
                        if let Ok(value) = serde_json::to_value(&init) {
                            events.emit(EngineEvent::IceCandidate(value));
                        }
                    }
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    events.emit(EngineEvent::RemoteTrack {
                        id: track.id(),
                        kind: track.kind().to_string(),
                    });
                })
            },
        ));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                info!("Peer connection state: {}", state);
                events.emit(EngineEvent::ConnectionState(state.to_string()));
                if state == RTCPeerConnectionState::Failed {
                    events.emit(EngineEvent::Failed("peer connection failed".to_string()));
                }
            })
        }));

        Ok(RtcEngine { pc })
    }
}

/// One `RTCPeerConnection`
pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
}

fn description_json(desc: &RTCSessionDescription) -> serde_json::Value {
    serde_json::json!({
        "type": desc.sdp_type.to_string().to_lowercase(),
        "sdp": desc.sdp
    })
}

fn parse_description(desc: &serde_json::Value) -> Result<RTCSessionDescription> {
    let sdp = desc
        .get("sdp")
        .and_then(|s| s.as_str())
        .ok_or_else(|| Error::Negotiation("Missing SDP in description".to_string()))?
        .to_string();

    match desc.get("type").and_then(|t| t.as_str()) {
        Some("offer") => RTCSessionDescription::offer(sdp).map_err(rtc_error),
        Some("answer") => RTCSessionDescription::answer(sdp).map_err(rtc_error),
        Some("pranswer") => RTCSessionDescription::pranswer(sdp).map_err(rtc_error),
        other => Err(Error::Negotiation(format!(
            "Unsupported description type: {:?}",
            other
        ))),
    }
}

/// `Ok(None)` only for the empty end-of-candidates marker
fn parse_candidate(candidate: &serde_json::Value) -> Result<Option<RTCIceCandidateInit>> {
    let candidate_str = candidate
        .get("candidate")
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::Negotiation(format!("invalid candidate: {}", candidate)))?;
    if candidate_str.is_empty() {
        return Ok(None);
    }

    Ok(Some(RTCIceCandidateInit {
        candidate: candidate_str.to_string(),
        sdp_mid: candidate
            .get("sdpMid")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string()),
        sdp_mline_index: candidate
            .get("sdpMLineIndex")
            .and_then(|i| i.as_u64())
            .map(|i| i as u16),
        username_fragment: candidate
            .get("usernameFragment")
            .and_then(|u| u.as_str())
            .map(|s| s.to_string()),
    }))
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_offer(&mut self) -> Result<serde_json::Value> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        Ok(description_json(&offer))
    }

    async fn create_answer(&mut self) -> Result<serde_json::Value> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        Ok(description_json(&answer))
    }

    async fn set_local_description(&mut self, desc: serde_json::Value) -> Result<()> {
        let desc = parse_description(&desc)?;
        self.pc.set_local_description(desc).await.map_err(rtc_error)
    }

    async fn set_remote_description(&mut self, desc: serde_json::Value) -> Result<()> {
        let desc = parse_description(&desc)?;
        self.pc.set_remote_description(desc).await.map_err(rtc_error)
    }

    async fn add_ice_candidate(&mut self, candidate: serde_json::Value) -> Result<()> {
        match parse_candidate(&candidate)? {
            Some(init) => self.pc.add_ice_candidate(init).await.map_err(rtc_error),
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.pc.close().await.map_err(rtc_error)
    }
}
