use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use webrtc::api::APIBuilder;
use webrtc::api::media_engine::MediaEngine;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::{PeerEvent, PeerSessionManager, SessionState, negotiate};

fn manager() -> anyhow::Result<(PeerSessionManager, super::PeerEventReceiver)> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    Ok((PeerSessionManager::new(vec![], tx)?, rx))
}

/// A receive-only viewer producing a complete offer.
async fn viewer_offer() -> anyhow::Result<(Arc<webrtc::peer_connection::RTCPeerConnection>, String)>
{
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let api = APIBuilder::new().with_media_engine(media_engine).build();
    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await?;

    let offer = pc.create_offer(None).await?;
    let mut gathering_done = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await?;
    let _ = gathering_done.recv().await;
    let sdp = pc
        .local_description()
        .await
        .ok_or(anyhow::anyhow!("no offer"))?
        .sdp;
    Ok((pc, sdp))
}

#[tokio::test]
async fn test_new_manager_is_idle() -> anyhow::Result<()> {
    let (peers, _rx) = manager()?;
    assert_eq!(peers.active_count(), 0);
    assert!(!peers.is_active());
    // Writing with nobody listening is a no-op
    peers
        .write_frame(Bytes::from_static(&[0, 0, 0, 1, 0x65]), Duration::from_millis(33))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_session_ids_are_unique_and_sessions_close() -> anyhow::Result<()> {
    let (mut peers, _rx) = manager()?;
    let (a, _) = peers.open_session().await?;
    let (b, _) = peers.open_session().await?;
    assert_ne!(a, b);
    assert_eq!(peers.active_count(), 2);
    assert_eq!(peers.session_state(a), Some(SessionState::Connecting));

    assert!(peers.handle_event(PeerEvent::HandshakeComplete {
        id: a,
        answer: String::new(),
    }));
    assert_eq!(peers.session_state(a), Some(SessionState::Connected));
    // A second completion is not a new join
    assert!(!peers.handle_event(PeerEvent::HandshakeComplete {
        id: a,
        answer: String::new(),
    }));

    peers.handle_event(PeerEvent::ConnectionState {
        id: a,
        state: RTCPeerConnectionState::Failed,
    });
    assert_eq!(peers.session_state(a), None);
    assert_eq!(peers.active_count(), 1);
    assert!(peers.is_active());

    peers.close_all();
    assert!(!peers.is_active());
    assert_eq!(peers.session_state(b), None);
    Ok(())
}

#[tokio::test]
async fn test_events_for_unknown_sessions_are_ignored() -> anyhow::Result<()> {
    let (mut peers, _rx) = manager()?;
    let (id, _) = peers.open_session().await?;

    assert!(!peers.handle_event(PeerEvent::HandshakeComplete {
        id: id + 100,
        answer: String::new(),
    }));
    peers.handle_event(PeerEvent::ConnectionState {
        id: id + 100,
        state: RTCPeerConnectionState::Closed,
    });
    peers.handle_event(PeerEvent::HandshakeFailed {
        id: id + 100,
        error: "late".into(),
    });
    assert_eq!(peers.sessions(), vec![(id, SessionState::Connecting)]);
    Ok(())
}

#[tokio::test]
async fn test_bad_offer_fails_only_that_session() -> anyhow::Result<()> {
    let (mut peers, _rx) = manager()?;
    let (good, _) = peers.open_session().await?;
    let (bad, pc) = peers.open_session().await?;

    let result = negotiate(&pc, "this is not sdp".to_string()).await;
    let error = result.expect_err("garbage offer must fail");
    peers.handle_event(PeerEvent::HandshakeFailed {
        id: bad,
        error: format!("{:#}", error),
    });

    assert_eq!(peers.session_state(bad), None);
    assert_eq!(peers.session_state(good), Some(SessionState::Connecting));
    Ok(())
}

#[tokio::test]
async fn test_negotiate_answers_viewer_offer() -> anyhow::Result<()> {
    let (mut peers, _rx) = manager()?;
    let (viewer, offer) = viewer_offer().await?;
    let (id, pc) = peers.open_session().await?;

    let answer = tokio::time::timeout(Duration::from_secs(10), negotiate(&pc, offer)).await??;
    assert!(answer.sdp.contains("m=video"));
    assert!(answer.sdp.contains("H264"));
    assert!(peers.handle_event(PeerEvent::HandshakeComplete {
        id,
        answer: answer.sdp.clone(),
    }));

    peers.close_all();
    viewer.close().await?;
    Ok(())
}
