#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Simulmesh
//! Simulmesh is the forwarding core of a simulcast-aware WebRTC SFU. It reads every layer a
//! client publishes, picks per subscriber the layer its downlink can carry, and rewrites the
//! chosen layer into one continuous outbound stream. Signaling is left to the host application.
//!
//! A [`hub::Hub`] owns rooms. A client joins a [`room::Room`] through a
//! [`peer_transport::PeerTransport`], which publishes the tracks the client sends and creates a
//! [`session::SubscriberSession`] receiving every track of the other clients.

/// Allocation of downlink bandwidth across a session's forwarders.
pub mod allocator;
/// Codec table and [`webrtc::api::media_engine::MediaEngine`] registration.
pub mod codec;
/// Configuration for [`hub::Hub`], [`room::Room`] and [`session::SubscriberSession`].
pub mod config;
/// JSON messages exchanged over a client's data channel.
pub mod data_channel;
pub mod error;
/// Forwarding of one published track to one subscriber.
pub mod forwarder;
/// Hub is a module that manages multiple rooms.
pub mod hub;
/// [`webrtc::peer_connection::RTCPeerConnection`] of one client.
pub mod peer_transport;
/// Published tracks and the registry of a room.
pub mod published_track;
/// Reader of one inbound layer stream.
pub mod remote_track;
/// Room is a module that determines which media to distribute to whom.
pub mod room;
/// RTP packet related module.
pub mod rtp;
/// Receiving side of one client.
pub mod session;
pub mod transport;
/// Voice activity detection.
pub mod vad;
