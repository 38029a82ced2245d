//! Peer-connection sessions sharing one outbound H.264 track.
//!
//! The manager is owned by the pipeline actor. Signaling callbacks never touch
//! it directly; they post [`PeerEvent`]s that the actor feeds back through
//! [`PeerSessionManager::handle_event`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::PipelineError;

pub type SessionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug)]
pub enum PeerEvent {
    /// `answer` is the local SDP returned to the viewer.
    HandshakeComplete { id: SessionId, answer: String },
    HandshakeFailed { id: SessionId, error: String },
    ConnectionState {
        id: SessionId,
        state: RTCPeerConnectionState,
    },
}

pub type PeerEventSender = mpsc::Sender<PeerEvent>;
pub type PeerEventReceiver = mpsc::Receiver<PeerEvent>;

struct PeerSession {
    state: SessionState,
    pc: Arc<RTCPeerConnection>,
}

pub struct PeerSessionManager {
    api: API,
    ice_urls: Vec<String>,
    track: Arc<TrackLocalStaticSample>,
    sessions: HashMap<SessionId, PeerSession>,
    next_id: SessionId,
    events: PeerEventSender,
}

impl PeerSessionManager {
    /// `ice_urls` may be empty for host-only candidates.
    pub fn new(ice_urls: Vec<String>, events: PeerEventSender) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "lite-relay".to_owned(),
        ));

        Ok(Self {
            api,
            ice_urls,
            track,
            sessions: HashMap::new(),
            next_id: 1,
            events,
        })
    }

    /// Creates a `Connecting` session bound to the shared track. The returned
    /// connection still has to be negotiated with [`negotiate`].
    pub async fn open_session(
        &mut self,
    ) -> Result<(SessionId, Arc<RTCPeerConnection>), PipelineError> {
        let id = self.next_id;
        self.next_id += 1;

        let ice_servers = if self.ice_urls.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_urls.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| PipelineError::Handshake(format!("create peer connection: {}", e)))?,
        );

        let track = Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>;
        let rtp_sender = match pc.add_track(track).await {
            Ok(sender) => sender,
            Err(e) => {
                close_in_background(id, Arc::clone(&pc));
                return Err(PipelineError::Handshake(format!("add track: {}", e)));
            }
        };
        // RTCP must be drained for the interceptors to run.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
        });

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent::ConnectionState { id, state }).await;
            })
        }));

        self.sessions.insert(
            id,
            PeerSession {
                state: SessionState::Connecting,
                pc: Arc::clone(&pc),
            },
        );
        log::info!("peer[{}] session opened ({} active)", id, self.sessions.len());
        Ok((id, pc))
    }

    /// Applies a signaling event. Returns true when a session became connected.
    pub fn handle_event(&mut self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::HandshakeComplete { id, .. } => self.mark_connected(id),
            PeerEvent::HandshakeFailed { id, error } => {
                if self.sessions.contains_key(&id) {
                    log::warn!("peer[{}] handshake failed: {}", id, error);
                    self.close_session(id);
                }
                false
            }
            PeerEvent::ConnectionState { id, state } => match state {
                RTCPeerConnectionState::Connected => {
                    log::info!("peer[{}] connection established", id);
                    false
                }
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Disconnected
                | RTCPeerConnectionState::Closed => {
                    if self.sessions.contains_key(&id) {
                        log::info!("peer[{}] connection {}", id, state);
                        self.close_session(id);
                    }
                    false
                }
                _ => false,
            },
        }
    }

    fn mark_connected(&mut self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.state == SessionState::Connecting => {
                session.state = SessionState::Connected;
                log::info!("peer[{}] handshake complete", id);
                true
            }
            _ => false,
        }
    }

    pub fn close_session(&mut self, id: SessionId) {
        if let Some(mut session) = self.sessions.remove(&id) {
            session.state = SessionState::Closed;
            close_in_background(id, session.pc);
            log::info!("peer[{}] session closed ({} active)", id, self.sessions.len());
        }
    }

    pub fn close_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id);
        }
    }

    /// Writes one encoded access unit to the shared track.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> anyhow::Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .context("write sample")
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// True while any session is connecting or connected.
    pub fn is_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|s| s.state)
    }

    pub fn sessions(&self) -> Vec<(SessionId, SessionState)> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|(id, s)| (*id, s.state)).collect();
        sessions.sort_by_key(|(id, _)| *id);
        sessions
    }
}

fn close_in_background(id: SessionId, pc: Arc<RTCPeerConnection>) {
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            log::warn!("peer[{}] close: {}", id, e);
        }
    });
}

/// Offer/answer exchange: applies the remote offer, creates and applies the
/// answer, and waits for ICE gathering so the answer carries all candidates.
pub async fn negotiate(
    pc: &RTCPeerConnection,
    offer_sdp: String,
) -> anyhow::Result<RTCSessionDescription> {
    let offer = RTCSessionDescription::offer(offer_sdp).context("parse offer")?;
    pc.set_remote_description(offer)
        .await
        .context("set remote description")?;
    let answer = pc.create_answer(None).await.context("create answer")?;

    let mut gathering_done = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .context("set local description")?;
    let _ = gathering_done.recv().await;

    pc.local_description()
        .await
        .ok_or(anyhow::anyhow!("no local description"))
}

#[cfg(test)]
#[path = "peer_test.rs"]
mod peer_test;
