// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use super::*;

use crate::test_utils::*;

use std::time::Duration;

use rstest::rstest;

fn accept_server(config: &Config) -> Connection {
    accept(
        0x2222,
        &odcid(),
        server_addr(),
        client_addr(),
        config,
        Box::new(StaticKeys::new(true)),
        Instant::now(),
    )
    .unwrap()
}

#[test]
fn handshake() {
    let mut pipe = Pipe::new().unwrap();

    assert_eq!(pipe.handshake(), Ok(()));

    assert!(pipe.client.is_established());
    assert!(pipe.server.is_established());

    assert!(pipe.client.is_handshake_confirmed());
    assert!(pipe.server.is_handshake_confirmed());

    assert!(!pipe.server.flags().handshake_done_pending);
    assert!(pipe.server.flags().peer_validated_addr);

    // Each side learnt the other's connection ID from long headers.
    assert_eq!(pipe.client.dcid(), pipe.server.scid());
    assert_eq!(pipe.server.dcid(), pipe.client.scid());

    assert_eq!(pipe.client.version(), PROTOCOL_VERSION_V1);
    assert_eq!(pipe.server.close_state(), CloseState::Open);
}

#[test]
fn reject_short_odcid() {
    let res = accept(
        0x2222,
        &ConnectionId::from_slice(&[0xba; 7]),
        server_addr(),
        client_addr(),
        &config(),
        Box::new(StaticKeys::new(true)),
        Instant::now(),
    );

    assert_eq!(res.err(), Some(Error::InvalidPacket));
}

#[test]
fn unknown_version_config() {
    assert_eq!(Config::new(0xbabababa).err(), Some(Error::UnknownVersion));
}

#[test]
fn invalid_cwnd_bounds() {
    let mut config = config();

    assert_eq!(config.set_cwnd_bounds(0, 10), Err(Error::InvalidState));
    assert_eq!(config.set_cwnd_bounds(20000, 10000), Err(Error::InvalidState));
    assert_eq!(config.set_cwnd_bounds(2500, 10000), Ok(()));
}

#[test]
fn server_drops_small_initial() {
    let mut pipe = Pipe::new().unwrap();

    // Server Initial packets are not padded, the client accepts them.
    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    let mut dgram =
        send(&mut pipe.server, Level::Initial, &ping(), ack_eliciting(), pipe.now)
            .unwrap();

    assert!(dgram.len() < packet::INITIAL_PACKET_MINLEN);

    let mut server = accept_server(&config());

    assert_eq!(
        recv(&mut server, &mut dgram, client_addr(), server_addr(), pipe.now),
        Ok(dgram.len())
    );

    assert_eq!(server.space(Epoch::Initial).largest_rx_pkt_num(), None);
    assert_eq!(server.stats().dropped_pkt, 1);
}

#[test]
fn duplicate_packet_dropped() {
    let mut pipe = Pipe::new().unwrap();

    let mut dgram = send(
        &mut pipe.client,
        Level::Initial,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    let mut copy = dgram.clone();

    recv(&mut pipe.server, &mut dgram, client_addr(), server_addr(), pipe.now)
        .unwrap();
    recv(&mut pipe.server, &mut copy, client_addr(), server_addr(), pipe.now)
        .unwrap();

    assert_eq!(pipe.server.stats().dropped_pkt, 1);
    assert_eq!(pipe.server.space(Epoch::Initial).largest_rx_pkt_num(), Some(0));
}

#[test]
fn garbage_counted_as_parsing_error() {
    let mut server = accept_server(&config());

    let mut dgram = [0xc0, 0x00, 0x00];

    assert_eq!(
        recv(
            &mut server,
            &mut dgram,
            client_addr(),
            server_addr(),
            Instant::now()
        ),
        Ok(3)
    );

    assert_eq!(server.stats().dropped_parsing, 1);
    assert_eq!(server.bytes().rx, 3);
}

#[test]
fn client_drops_unknown_peer() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    let mut dgram =
        send(&mut pipe.server, Level::Initial, &ping(), ack_eliciting(), pipe.now)
            .unwrap();

    let other = "127.0.0.9:443".parse().unwrap();

    assert_eq!(
        recv(&mut pipe.client, &mut dgram, other, client_addr(), pipe.now),
        Err(Error::Done)
    );

    assert_eq!(pipe.client.stats().dropped_pkt, 1);
    assert!(!pipe.client.space(Epoch::Initial).ack_required);
}

#[test]
fn zero_rtt_shares_application_space() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    pipe.client.on_keys_available(Level::ZeroRTT).unwrap();
    pipe.server.on_keys_available(Level::ZeroRTT).unwrap();

    let mut early = send(
        &mut pipe.client,
        Level::ZeroRTT,
        &data_frame(b"early"),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    let mut replay = early.clone();

    let mut received = Vec::new();

    let mut handler = |conn: &mut Connection, pkt: &RxPacket, payload: &[u8]| {
        received.push((pkt.pkt_num, pkt.level));
        handle_frames(conn, pkt, payload)
    };

    let info = RecvInfo {
        from: client_addr(),
        to: server_addr(),
    };

    pipe.server
        .recv(&mut early, info, pipe.now, &mut handler)
        .unwrap();

    assert_eq!(
        pipe.server.space(Epoch::Application).largest_rx_pkt_num(),
        Some(0)
    );

    pipe.handshake().unwrap();

    // 1-RTT packets continue the packet numbers of 0-RTT.
    let mut dgram = send(
        &mut pipe.client,
        Level::OneRTT,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    pipe.server
        .recv(&mut dgram, info, pipe.now, &mut handler)
        .unwrap();

    assert_eq!(
        pipe.server.space(Epoch::Application).largest_rx_pkt_num(),
        Some(1)
    );

    // A replayed 0-RTT packet is a duplicate in the Application space.
    let dropped = pipe.server.stats().dropped_pkt;

    pipe.server
        .recv(&mut replay, info, pipe.now, &mut handler)
        .unwrap();

    assert_eq!(pipe.server.stats().dropped_pkt, dropped + 1);
    assert_eq!(received, vec![(0, Level::ZeroRTT), (1, Level::OneRTT)]);

    let mux = RecordingMux::default();
    pipe.server.attach_mux(Box::new(mux.clone())).unwrap();

    assert_eq!(*mux.events.lock(), vec![MuxEvent::Deliver(b"early".to_vec())]);
}

#[test]
fn client_drops_zero_rtt() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    pipe.server.on_keys_available(Level::ZeroRTT).unwrap();

    let mut dgram = send(
        &mut pipe.server,
        Level::ZeroRTT,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    assert!(recv(
        &mut pipe.client,
        &mut dgram,
        server_addr(),
        client_addr(),
        pipe.now
    )
    .is_ok());

    assert_eq!(pipe.client.stats().dropped_pkt, 1);
    assert_eq!(
        pipe.client.space(Epoch::Application).largest_rx_pkt_num(),
        None
    );
}

#[test]
fn client_initial_padding() {
    let mut pipe = Pipe::new().unwrap();

    let dgram = send(
        &mut pipe.client,
        Level::Initial,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    assert_eq!(dgram.len(), packet::INITIAL_PACKET_MINLEN);
    assert_eq!(pipe.client.bytes().tx, dgram.len() as u64);
    assert_eq!(pipe.client.bytes().prep, 0);
}

#[test]
fn anti_amplification() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    assert_eq!(pipe.server.bytes().rx, 1200);
    assert!(!pipe.server.flags().peer_validated_addr);

    // Padding only payloads.
    let payload = vec![0; 1000];

    for _ in 0..3 {
        pipe.server_to_client(Level::Initial, &payload, ack_eliciting())
            .unwrap();
    }

    assert!(pipe.server.bytes().tx <= 3 * 1200);

    let mut out = [0; 1500];

    assert_eq!(
        pipe.server.send_pkt(
            Level::Initial,
            &payload,
            ack_eliciting(),
            &mut out,
            pipe.now
        ),
        Err(Error::Done)
    );

    assert!(pipe.server.flags().amplification_reached);
    assert_eq!(pipe.server.bytes().prep, 0);

    // More bytes from the client raise the limit.
    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    assert!(pipe
        .server_to_client(Level::Initial, &payload, ack_eliciting())
        .is_ok());
    assert!(!pipe.server.flags().amplification_reached);

    // A Handshake packet validates the client address.
    pipe.server.on_keys_available(Level::Handshake).unwrap();
    pipe.client.on_keys_available(Level::Handshake).unwrap();

    pipe.client_to_server(Level::Handshake, &ping(), ack_eliciting())
        .unwrap();

    assert!(pipe.server.flags().peer_validated_addr);
    assert!(pipe.server.may_send(usize::MAX / 2));
}

#[test]
fn retry_token_validates_address() {
    let mut server = accept_server(&config());

    assert!(!server.may_send(1));
    assert!(server.flags().amplification_reached);

    server.on_retry_token_validated();

    assert!(server.may_send(1));
    assert!(server.flags().peer_validated_addr);
    assert!(!server.flags().amplification_reached);
}

#[rstest]
fn retry_threshold(#[values(0, 1, 100)] threshold: usize) {
    let mut config = config();

    assert!(!retry_required(&config, 99));
    assert!(retry_required(&config, 100));

    config.set_retry_threshold(threshold);

    assert!(retry_required(&config, threshold));
    assert_eq!(
        retry_required(&config, threshold.saturating_sub(1)),
        threshold == 0
    );
}

#[test]
fn discard_spaces_once() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    for conn in [&pipe.client, &pipe.server] {
        assert!(conn.space(Epoch::Initial).is_discarded());
        assert!(conn.space(Epoch::Handshake).is_discarded());
        assert!(!conn.space(Epoch::Application).is_discarded());

        assert!(conn.level(Level::Initial).is_none());
        assert!(conn.level(Level::Handshake).is_none());
        assert!(conn.level(Level::OneRTT).is_some());

        // Only 1-RTT packets are left in flight.
        assert_eq!(
            conn.paths().active().in_flight(),
            conn.space(Epoch::Application).bytes_in_flight()
        );
    }

    // Discarded levels cannot come back.
    assert_eq!(
        pipe.server.on_keys_available(Level::Handshake),
        Err(Error::InvalidState)
    );

    let mut out = [0; 1500];

    assert_eq!(
        pipe.server.send_pkt(
            Level::Handshake,
            &ping(),
            ack_eliciting(),
            &mut out,
            pipe.now
        ),
        Err(Error::InvalidState)
    );
}

#[test]
fn handshake_completed_once() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    assert_eq!(pipe.server.on_handshake_completed(pipe.now), Err(Error::Done));
}

#[test]
fn handshake_done_from_client() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    assert_eq!(
        pipe.client_to_server(Level::OneRTT, &[HANDSHAKE_DONE], ack_eliciting()),
        Err(Error::ProtocolViolation)
    );

    assert_eq!(pipe.server.close_state(), CloseState::ImmediateClose);
    assert_eq!(
        pipe.server.local_error(),
        Some(&ConnectionError {
            is_app: false,
            error_code: 0xa,
            reason: vec![],
        })
    );
}

#[test]
fn lost_handshake_done_is_resent() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let pn = pipe.server.space(Epoch::Application).next_pkt_num() - 1;

    pipe.server.on_packet_lost(Epoch::Application, pn, pipe.now);

    assert!(pipe.server.flags().handshake_done_pending);
    assert_eq!(pipe.server.stats().lost_pkt, 1);
    assert_eq!(pipe.server.paths().active().in_flight(), 0);
}

#[test]
fn key_update_initiated_before_confirmation() {
    let mut pipe = Pipe::new().unwrap();

    assert_eq!(
        pipe.client.initiate_key_update(pipe.now),
        Err(Error::InvalidState)
    );
}

#[test]
fn key_update() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let mut old = send(
        &mut pipe.client,
        Level::OneRTT,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    assert_eq!(pipe.client.initiate_key_update(pipe.now), Ok(()));

    // The peer did not confirm the first update yet.
    assert_eq!(
        pipe.client.initiate_key_update(pipe.now),
        Err(Error::KeyUpdate)
    );

    let mut new = send(
        &mut pipe.client,
        Level::OneRTT,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    let mut phases = Vec::new();

    let mut handler = |conn: &mut Connection, pkt: &RxPacket, payload: &[u8]| {
        phases.push((pkt.pkt_num, pkt.key_phase));
        handle_frames(conn, pkt, payload)
    };

    let info = RecvInfo {
        from: client_addr(),
        to: server_addr(),
    };

    // The packet of the new phase overtakes the older one.
    pipe.server
        .recv(&mut new, info, pipe.now, &mut handler)
        .unwrap();
    pipe.server
        .recv(&mut old, info, pipe.now, &mut handler)
        .unwrap();

    assert_eq!(phases, vec![(1, KeyPhase(1)), (0, KeyPhase(0))]);

    assert_eq!(pipe.server.stats().dropped_pkt, 0);

    let keys = &pipe.server.level(Level::OneRTT).unwrap().keys;

    assert_eq!(keys.phase(), KeyPhase(1));
    assert!(keys.has_next());
    assert!(keys.prev_discard_deadline().is_some());

    // The client learns the update was confirmed.
    pipe.server_to_client(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    assert_eq!(pipe.client.initiate_key_update(pipe.now), Ok(()));
    assert_eq!(
        pipe.client.level(Level::OneRTT).unwrap().keys.phase(),
        KeyPhase(2)
    );
}

#[test]
fn previous_keys_discarded_on_timeout() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    pipe.client.initiate_key_update(pipe.now).unwrap();

    pipe.client_to_server(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    let deadline = pipe
        .server
        .level(Level::OneRTT)
        .unwrap()
        .keys
        .prev_discard_deadline()
        .unwrap();

    pipe.server.on_timeout(deadline);

    let keys = &pipe.server.level(Level::OneRTT).unwrap().keys;

    assert!(keys.prev().is_none());
    assert_eq!(keys.phase(), KeyPhase(1));
}

#[test]
fn unanswered_key_update_survives_timeout() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    pipe.client.initiate_key_update(pipe.now).unwrap();

    pipe.advance(Duration::from_secs(10));
    pipe.client.on_timeout(pipe.now);

    // The old keys are still needed to read the peer.
    assert!(pipe.client.level(Level::OneRTT).unwrap().keys.prev().is_some());

    assert_eq!(
        pipe.client.initiate_key_update(pipe.now),
        Err(Error::KeyUpdate)
    );

    // The server did not update yet, its packets are still readable.
    pipe.server_to_client(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    assert_eq!(pipe.client.stats().dropped_pkt, 0);
    assert_eq!(
        pipe.client.level(Level::OneRTT).unwrap().keys.phase(),
        KeyPhase(1)
    );

    // The server answers the update.
    pipe.client_to_server(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();
    pipe.server_to_client(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    let keys = &pipe.client.level(Level::OneRTT).unwrap().keys;

    assert!(!keys.is_awaiting_peer());
    assert!(keys.prev_discard_deadline().is_some());

    assert_eq!(pipe.client.initiate_key_update(pipe.now), Ok(()));
    assert_eq!(pipe.client.stats().dropped_pkt, 0);
}

#[test]
fn crypto_reassembly() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(
        Level::Initial,
        &crypto_frame(5, b"world"),
        ack_eliciting(),
    )
    .unwrap();

    let mut buf = [0; 32];

    assert_eq!(
        pipe.server.crypto_read(Level::Initial, &mut buf),
        Err(Error::Done)
    );

    pipe.client_to_server(
        Level::Initial,
        &crypto_frame(0, b"hello"),
        ack_eliciting(),
    )
    .unwrap();

    assert_eq!(pipe.server.crypto_read(Level::Initial, &mut buf), Ok(10));
    assert_eq!(&buf[..10], b"helloworld");

    assert_eq!(
        pipe.server.crypto_read(Level::ZeroRTT, &mut buf),
        Err(Error::InvalidState)
    );
}

#[test]
fn crypto_buffer_exceeded() {
    let mut pipe = Pipe::new().unwrap();

    assert_eq!(
        pipe.client_to_server(
            Level::Initial,
            &crypto_frame(1 << 20, b"far"),
            ack_eliciting(),
        ),
        Err(Error::CryptoBufferExceeded)
    );

    assert_eq!(pipe.server.close_state(), CloseState::ImmediateClose);
    assert_eq!(pipe.server.local_error().unwrap().error_code, 0xd);
}

#[test]
fn crypto_retransmission() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    let server = &mut pipe.server;

    server.crypto_send(Level::Initial, b"server hello").unwrap();
    server.crypto_flush(Level::Initial).unwrap();

    let mut data = [0; 64];
    let (off, len) = server.crypto_emit(Level::Initial, &mut data).unwrap();

    assert_eq!((off, len), (0, 12));

    let frames = SentFrames {
        ack_eliciting: true,
        crypto: Some((off, len)),
        ..Default::default()
    };

    let payload = crypto_frame(off, &data[..len]);

    send(server, Level::Initial, &payload, frames, pipe.now).unwrap();

    assert_eq!(
        server.crypto_emit(Level::Initial, &mut data),
        Err(Error::Done)
    );

    server.on_packet_lost(Epoch::Initial, 0, pipe.now);

    assert_eq!(server.crypto_emit(Level::Initial, &mut data), Ok((0, 12)));

    send(server, Level::Initial, &payload, frames, pipe.now).unwrap();
    server.on_packet_acked(Epoch::Initial, 1, pipe.now);

    assert_eq!(server.paths().active().in_flight(), 0);
    assert_eq!(
        server.crypto_emit(Level::Initial, &mut data),
        Err(Error::Done)
    );
}

#[test]
fn acked_padded_ack_keeps_pto_timer() {
    let mut pipe = Pipe::new().unwrap();
    let now = pipe.now;

    let client = &mut pipe.client;

    send(client, Level::Initial, &ping(), ack_eliciting(), now).unwrap();

    // ACK only, padded to the minimum Initial size.
    let ack_only = SentFrames {
        ack: true,
        ..Default::default()
    };

    send(client, Level::Initial, &[0], ack_only, now).unwrap();

    assert_eq!(client.paths().active().ifae_pkts(), 1);
    assert!(client.paths().active().loss_detection_timer().is_some());

    client.on_packet_acked(Epoch::Initial, 1, now);

    assert_eq!(client.paths().active().ifae_pkts(), 1);
    assert!(client.paths().active().loss_detection_timer().is_some());

    client.on_packet_acked(Epoch::Initial, 0, now);

    assert_eq!(client.paths().active().ifae_pkts(), 0);
    assert_eq!(client.paths().active().loss_detection_timer(), None);
}

#[test]
fn crypto_send_backpressure() {
    let mut config = config();
    config.set_crypto_in_flight_max(16);

    let mut server = accept_server(&config);

    assert_eq!(server.crypto_send(Level::Initial, &[0; 10]), Ok(()));
    assert_eq!(server.crypto_send(Level::Initial, &[0; 10]), Err(Error::Done));
    assert_eq!(server.crypto_send(Level::Initial, &[0; 6]), Ok(()));
}

#[test]
fn send_error_rewinds_prepared() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    let server = &mut pipe.server;

    server.crypto_send(Level::Initial, b"hello").unwrap();
    server.crypto_flush(Level::Initial).unwrap();

    let mut data = [0; 64];
    let (off, len) = server.crypto_emit(Level::Initial, &mut data).unwrap();

    let frames = SentFrames {
        ack_eliciting: true,
        crypto: Some((off, len)),
        ..Default::default()
    };

    let mut out = [0; 1500];

    let written = server
        .send_pkt(
            Level::Initial,
            &crypto_frame(off, &data[..len]),
            frames,
            &mut out,
            pipe.now,
        )
        .unwrap();

    assert_eq!(server.bytes().prep, written as u64);
    assert_eq!(server.paths().active().prep_in_flight(), written);

    let err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
    server.on_dgram_send_error(&err);

    assert_eq!(server.bytes().prep, 0);
    assert_eq!(server.bytes().tx, 0);
    assert_eq!(server.paths().active().prep_in_flight(), 0);
    assert_eq!(server.paths().active().in_flight(), 0);
    assert_eq!(server.stats().socket_full, 1);

    assert_eq!(server.crypto_emit(Level::Initial, &mut data), Ok((0, 5)));
}

#[test]
fn mux_lifecycle() {
    let mut server = accept_server(&config());
    let mux = RecordingMux::default();

    assert_eq!(server.mux_state(), MuxState::Null);
    assert_eq!(server.release_mux(), Err(Error::InvalidState));

    server.deliver(b"early");

    server.attach_mux(Box::new(mux.clone())).unwrap();

    assert_eq!(server.mux_state(), MuxState::Ready);
    assert_eq!(
        server.attach_mux(Box::new(mux.clone())),
        Err(Error::InvalidState)
    );

    server.deliver(b"late");

    server.release_mux().unwrap();

    assert_eq!(server.mux_state(), MuxState::Released);
    assert_eq!(server.release_mux(), Err(Error::InvalidState));
    assert_eq!(
        server.attach_mux(Box::new(mux.clone())),
        Err(Error::InvalidState)
    );

    server.deliver(b"discarded");

    assert_eq!(*mux.events.lock(), vec![
        MuxEvent::Deliver(b"early".to_vec()),
        MuxEvent::Deliver(b"late".to_vec()),
        MuxEvent::Released,
    ]);
}

#[test]
fn mux_buffer_overrun() {
    let mut server = accept_server(&config());

    server.deliver(&vec![0; 40000]);
    server.deliver(&vec![1; 40000]);

    assert_eq!(server.stats().dropped_pkt_bufoverrun, 1);

    let mux = RecordingMux::default();
    server.attach_mux(Box::new(mux.clone())).unwrap();

    assert_eq!(*mux.events.lock(), vec![MuxEvent::Deliver(vec![0; 40000])]);
}

#[test]
fn app_data_reaches_mux() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let mux = RecordingMux::default();
    pipe.server.attach_mux(Box::new(mux.clone())).unwrap();

    pipe.client_to_server(Level::OneRTT, &data_frame(b"GET /"), ack_eliciting())
        .unwrap();

    assert_eq!(*mux.events.lock(), vec![MuxEvent::Deliver(b"GET /".to_vec())]);
}

#[test]
fn draining_on_peer_close() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let mux = RecordingMux::default();
    pipe.server.attach_mux(Box::new(mux.clone())).unwrap();

    pipe.client.close(true, 0x42, b"bye").unwrap();
    assert_eq!(pipe.client.close(true, 0x42, b"bye"), Err(Error::Done));

    let mut out = [0; 1500];
    let len = pipe.client.send_close(&mut out, pipe.now).unwrap();

    assert_eq!(pipe.client.close_state(), CloseState::Closing);

    recv(
        &mut pipe.server,
        &mut out[..len],
        client_addr(),
        server_addr(),
        pipe.now,
    )
    .unwrap();

    assert_eq!(pipe.server.close_state(), CloseState::Draining);
    assert_eq!(
        pipe.server.peer_error(),
        Some(&ConnectionError {
            is_app: true,
            error_code: 0x42,
            reason: b"bye".to_vec(),
        })
    );

    assert_eq!(pipe.server.mux_state(), MuxState::Released);
    assert_eq!(*mux.events.lock(), vec![MuxEvent::Released]);

    // Nothing is sent while draining.
    assert_eq!(
        pipe.server.send_pkt(
            Level::OneRTT,
            &ping(),
            ack_eliciting(),
            &mut out,
            pipe.now
        ),
        Err(Error::Done)
    );
    assert_eq!(pipe.server.send_close(&mut out, pipe.now), Err(Error::Done));

    let stats = pipe.server.stats();
    assert_eq!(stats.draining, 1);
    assert_eq!(stats.immediate_close, 0);

    let expire = pipe.server.timeout_instant().unwrap();

    assert!(!pipe.server.is_reclaimable());

    pipe.server.on_timeout(expire);

    assert!(pipe.server.is_reclaimable());
    assert_eq!(pipe.server.timeout_instant(), None);

    let Pipe { server, .. } = pipe;

    let index = CidIndex::new();
    server.register_cids(&index, cid::ConnectionHandle(1)).unwrap();

    assert_eq!(index.len(), 2);

    assert!(server.finalize(&index).is_ok());
    assert!(index.is_empty());
}

#[test]
fn immediate_close_at_initial() {
    let mut config = config();
    config.set_max_close_retransmits(2);

    let mut pipe = Pipe::with_config(&config).unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    // Application closes cannot be carried by Initial packets.
    pipe.server.close(true, 0x42, b"secret").unwrap();

    assert_eq!(pipe.server.close_state(), CloseState::ImmediateClose);

    let mut out = [0; 1500];
    let len = pipe.server.send_close(&mut out, pipe.now).unwrap();

    assert_eq!(pipe.server.close_state(), CloseState::Closing);
    assert_eq!(pipe.server.send_close(&mut out, pipe.now), Err(Error::Done));

    let close = out[..len].to_vec();

    recv(
        &mut pipe.client,
        &mut out[..len],
        server_addr(),
        client_addr(),
        pipe.now,
    )
    .unwrap();

    assert_eq!(
        pipe.client.peer_error(),
        Some(&ConnectionError {
            is_app: false,
            error_code: WireErrorCode::ApplicationError as u64,
            reason: vec![],
        })
    );
    assert!(pipe.client.is_draining());

    // Retransmissions are triggered by peer packets, up to the limit.
    let mut sent = 0;

    for _ in 0..10 {
        let mut junk = [0; 100];

        recv(
            &mut pipe.server,
            &mut junk,
            client_addr(),
            server_addr(),
            pipe.now,
        )
        .unwrap();

        if let Ok(len) = pipe.server.send_close(&mut out, pipe.now) {
            assert_eq!(&out[..len], &close[..]);
            sent += 1;
        }
    }

    assert_eq!(sent, 2);

    let expire = pipe.server.timeout_instant().unwrap();
    pipe.server.on_timeout(expire);

    assert!(pipe.server.flags().exp_timer);
    assert_eq!(pipe.server.stats().expired, 1);

    let mut junk = [0; 100];

    assert_eq!(
        recv(
            &mut pipe.server,
            &mut junk,
            client_addr(),
            server_addr(),
            pipe.now
        ),
        Err(Error::TimedOut)
    );
}

#[test]
fn close_at_handshake_level() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    pipe.server.on_keys_available(Level::Handshake).unwrap();
    pipe.client.on_keys_available(Level::Handshake).unwrap();

    pipe.server.close(false, 0x1, b"internal").unwrap();

    let mut out = [0; 1500];
    let len = pipe.server.send_close(&mut out, pipe.now).unwrap();

    recv(
        &mut pipe.client,
        &mut out[..len],
        server_addr(),
        client_addr(),
        pipe.now,
    )
    .unwrap();

    assert_eq!(
        pipe.client.space(Epoch::Handshake).largest_rx_pkt_num(),
        Some(0)
    );
    assert_eq!(
        pipe.client.peer_error(),
        Some(&ConnectionError {
            is_app: false,
            error_code: 0x1,
            reason: b"internal".to_vec(),
        })
    );
}

#[test]
fn into_closing() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let Pipe { server, now, .. } = pipe;

    let mut server = match server.into_closing() {
        Ok(_) => panic!("open connection reduced"),

        Err(conn) => conn,
    };

    server.close(false, 0x0, b"").unwrap();

    let mut out = [0; 1500];
    let len = server.send_close(&mut out, now).unwrap();

    let scids: Vec<ConnectionId> =
        server.scids().map(|(_, cid)| cid.clone()).collect();

    let mut closing = match server.into_closing() {
        Ok(v) => v,

        Err(_) => panic!("closing connection not reduced"),
    };

    assert!(!closing.is_draining());
    assert_eq!(closing.peer_addr(), client_addr());

    // Local connection IDs and the original destination connection ID.
    assert_eq!(closing.cids().len(), scids.len() + 1);
    assert!(closing.cids().contains(&odcid()));

    assert_eq!(closing.send_close(&mut out), Err(Error::Done));

    closing.recv(64);

    assert_eq!(closing.send_close(&mut out), Ok(len));

    let expire = closing.timeout().unwrap();
    closing.on_timeout(expire);

    assert!(closing.is_expired());
}

#[test]
fn frame_loss_escalation() {
    let mut server = accept_server(&config());

    assert_eq!(server.on_frame_lost(10), Ok(()));
    assert_eq!(server.close_state(), CloseState::Open);

    assert_eq!(server.on_frame_lost(11), Err(Error::FrameLoss));
    assert_eq!(server.close_state(), CloseState::ImmediateClose);
    assert_eq!(server.local_error().unwrap().error_code, 0xa);
}

#[test]
fn idle_timeout() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let idle = pipe.now + Duration::from_secs(30);

    assert!(pipe.server.timeout_instant().unwrap() <= idle);

    pipe.server.on_timeout(idle);

    assert!(pipe.server.flags().exp_timer);
    assert_eq!(pipe.server.stats().expired, 1);
    assert!(pipe.server.is_reclaimable());

    assert_eq!(pipe.server.close_state(), CloseState::Open);

    let mut out = [0; 1500];

    assert_eq!(
        pipe.server.send_pkt(
            Level::OneRTT,
            &ping(),
            ack_eliciting(),
            &mut out,
            idle
        ),
        Err(Error::TimedOut)
    );

    let mut junk = [0; 100];

    assert_eq!(
        recv(&mut pipe.server, &mut junk, client_addr(), server_addr(), idle),
        Err(Error::TimedOut)
    );
}

#[test]
fn handshake_timeout() {
    let mut config = config();
    config.set_handshake_timeout(5000);

    let mut pipe = Pipe::with_config(&config).unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    let deadline = pipe.now + Duration::from_secs(5);

    pipe.server.on_timeout(deadline);

    assert!(pipe.server.flags().exp_timer);

    // No CONNECTION_CLOSE is sent on expiration.
    let mut out = [0; 1500];
    assert_eq!(pipe.server.send_close(&mut out, deadline), Err(Error::Done));
}

#[test]
fn handshake_timer_cleared() {
    let mut config = config();
    config.set_handshake_timeout(5000);

    let mut pipe = Pipe::with_config(&config).unwrap();

    pipe.handshake().unwrap();

    pipe.server.on_timeout(pipe.now + Duration::from_secs(5));

    assert!(!pipe.server.flags().exp_timer);
}

#[test]
fn ack_timer() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    // The client received a single ack-eliciting 1-RTT packet.
    let ack_at = pipe.now + Duration::from_millis(25);

    assert_eq!(pipe.client.timeout_instant(), Some(ack_at));
    assert!(!pipe.client.space(Epoch::Application).ack_required);

    pipe.client.on_timeout(ack_at);

    assert!(pipe.client.space(Epoch::Application).ack_required);
    assert!(pipe.client.flags().ack_timer_fired);

    let frames = SentFrames {
        ack: true,
        ..Default::default()
    };

    send(&mut pipe.client, Level::OneRTT, &ping(), frames, ack_at).unwrap();

    assert!(!pipe.client.space(Epoch::Application).ack_required);
    assert!(!pipe.client.flags().ack_timer_fired);
}

#[test]
fn immediate_ack_after_two_packets() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    pipe.client_to_server(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    assert!(!pipe.server.space(Epoch::Application).ack_required);

    pipe.client_to_server(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    assert!(pipe.server.space(Epoch::Application).ack_required);
}

#[test]
fn spin_bit() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    // The client inverts the spin value it last saw.
    pipe.client_to_server(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    assert!(pipe.server.flags().spin_bit);

    // The server reflects it.
    pipe.server_to_client(Level::OneRTT, &ping(), ack_eliciting())
        .unwrap();

    assert!(pipe.client.flags().spin_bit);
}

#[test]
fn migration_and_handoff() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let new_addr: SocketAddr = "127.0.0.2:5555".parse().unwrap();

    let mut dgram = send(
        &mut pipe.client,
        Level::OneRTT,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    recv(&mut pipe.server, &mut dgram, new_addr, server_addr(), pipe.now)
        .unwrap();

    assert_eq!(pipe.server.paths().len(), 2);
    assert!(pipe.server.paths().pending_path_id().is_some());

    assert_eq!(
        pipe.server.on_path_validated(client_addr()),
        Err(Error::InvalidPathState)
    );

    pipe.server.on_path_validated(new_addr).unwrap();

    assert_eq!(pipe.server.paths().len(), 1);
    assert_eq!(pipe.server.paths().active().peer_addr(), new_addr);
    assert!(pipe.server.flags().affinity_changed);
    assert_eq!(pipe.server.stats().conn_migration_done, 1);

    // Move the connection to the thread handling the new address.
    assert_eq!(pipe.server.owner(), Some(0));

    pipe.server.rebind(3).unwrap();

    assert_eq!(pipe.server.owner(), None);
    assert_eq!(pipe.server.rebind(2), Err(Error::InvalidState));

    let mut out = [0; 1500];

    assert_eq!(
        pipe.server.send_pkt(
            Level::OneRTT,
            &ping(),
            ack_eliciting(),
            &mut out,
            pipe.now
        ),
        Err(Error::InvalidState)
    );

    let Pipe { server, .. } = pipe;

    let mailboxes = Mailboxes::new(4);

    assert!(mailboxes.send(3, server).is_ok());

    let mut server = mailboxes.get(3).unwrap().pop().unwrap();

    assert_eq!(server.finalize_rebind(2), Err(Error::InvalidState));
    assert_eq!(server.finalize_rebind(3), Ok(()));

    assert_eq!(server.owner(), Some(3));
    assert!(!server.flags().affinity_changed);
}

#[test]
fn failed_path_validation() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    let new_addr: SocketAddr = "127.0.0.2:5555".parse().unwrap();

    let mut dgram = send(
        &mut pipe.client,
        Level::OneRTT,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    recv(&mut pipe.server, &mut dgram, new_addr, server_addr(), pipe.now)
        .unwrap();

    assert_eq!(pipe.server.on_path_validation_failed(), Ok(()));
    assert_eq!(
        pipe.server.on_path_validation_failed(),
        Err(Error::InvalidPathState)
    );

    assert_eq!(pipe.server.paths().len(), 1);
    assert_eq!(pipe.server.paths().active().peer_addr(), client_addr());
}

#[test]
fn no_migration_before_confirmation() {
    let mut pipe = Pipe::new().unwrap();

    let new_addr: SocketAddr = "127.0.0.2:5555".parse().unwrap();

    let mut dgram = send(
        &mut pipe.client,
        Level::Initial,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    recv(&mut pipe.server, &mut dgram, new_addr, server_addr(), pipe.now)
        .unwrap();

    assert_eq!(pipe.server.paths().len(), 1);
}

#[test]
fn owner_fixed_after_first_packet() {
    let mut pipe = Pipe::new().unwrap();

    assert_eq!(pipe.server.set_owner(5), Ok(()));
    assert_eq!(pipe.server.owner(), Some(5));

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    assert_eq!(pipe.server.set_owner(1), Err(Error::InvalidState));
}

#[test]
fn connection_ids() {
    let mut server = accept_server(&config());

    let index = CidIndex::new();
    let handle = cid::ConnectionHandle(7);

    server.register_cids(&index, handle).unwrap();

    assert_eq!(index.lookup(server.scid()), Some(handle));
    assert_eq!(index.lookup(&odcid()), Some(handle));

    let (seq, cid) = server.issue_cid(&index, handle).unwrap();

    assert_eq!(seq, 1);
    assert_eq!(index.lookup(&cid), Some(handle));

    // The peer accepts two connection IDs by default.
    assert_eq!(server.issue_cid(&index, handle), Err(Error::IdLimit));

    server.set_peer_active_cid_limit(3);

    let (seq, _) = server.issue_cid(&index, handle).unwrap();
    assert_eq!(seq, 2);

    server.retire_cid(1, &index).unwrap();

    assert_eq!(index.lookup(&cid), None);
    assert_eq!(server.retire_cid(1, &index), Err(Error::InvalidState));

    // Never issued.
    assert_eq!(server.retire_cid(3, &index), Err(Error::ProtocolViolation));
    assert_eq!(server.scids().count(), 2);

    server.unregister_cids(&index);

    assert!(index.is_empty());
}

#[test]
fn version_negotiation() {
    let mut pipe = Pipe::new().unwrap();

    send(
        &mut pipe.client,
        Level::Initial,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    let scid = pipe.client.scid().clone();

    let mut vn = vec![0x80, 0, 0, 0, 0];
    vn.push(scid.len() as u8);
    vn.extend_from_slice(&scid);
    vn.push(odcid().len() as u8);
    vn.extend_from_slice(&odcid());
    vn.extend_from_slice(&PROTOCOL_VERSION_V2.to_be_bytes());

    let mut copy = vn.clone();

    recv(&mut pipe.client, &mut vn, server_addr(), client_addr(), pipe.now)
        .unwrap();

    assert_eq!(pipe.client.version(), PROTOCOL_VERSION_V2);
    assert_eq!(pipe.client.space(Epoch::Initial).next_pkt_num(), 0);

    // Only one version negotiation per connection.
    recv(
        &mut pipe.client,
        &mut copy,
        server_addr(),
        client_addr(),
        pipe.now,
    )
    .unwrap();

    assert_eq!(pipe.client.stats().dropped_pkt, 1);

    // A v2 server understands the restarted handshake.
    let mut server = accept_server(&Config::new(PROTOCOL_VERSION_V2).unwrap());

    let mut dgram = send(
        &mut pipe.client,
        Level::Initial,
        &ping(),
        ack_eliciting(),
        pipe.now,
    )
    .unwrap();

    recv(&mut server, &mut dgram, client_addr(), server_addr(), pipe.now)
        .unwrap();

    assert_eq!(server.space(Epoch::Initial).largest_rx_pkt_num(), Some(0));
}

#[test]
fn compatible_version() {
    let mut server = accept_server(&config());

    assert_eq!(
        server.set_negotiated_version(PROTOCOL_VERSION_DRAFT29),
        Err(Error::InvalidState)
    );

    assert_eq!(server.set_negotiated_version(PROTOCOL_VERSION_V2), Ok(()));

    assert_eq!(server.version(), PROTOCOL_VERSION_V2);
    assert_eq!(server.original_version(), PROTOCOL_VERSION_V1);

    assert_eq!(
        server.set_negotiated_version(PROTOCOL_VERSION_V2),
        Err(Error::InvalidState)
    );
}

#[test]
fn blocked_frames_counted() {
    let server = accept_server(&config());
    let counters = server.counters();

    server.on_blocked_frame(stats::BlockedFrame::DataBlocked);
    server.on_blocked_frame(stats::BlockedFrame::StreamsBlockedUni);

    let stats = counters.snapshot();

    assert_eq!(stats.data_blocked, 1);
    assert_eq!(stats.streams_blocked_uni, 1);
    assert_eq!(stats.stream_data_blocked, 0);
}

#[test]
fn sent_counters() {
    let mut pipe = Pipe::new().unwrap();

    pipe.handshake().unwrap();

    assert_eq!(pipe.client.stats().sent_pkt, 2);
    assert_eq!(pipe.server.stats().sent_pkt, 3);
}

#[test]
fn backrefs_detached() {
    let mut pipe = Pipe::new().unwrap();

    pipe.client_to_server(Level::Initial, &ping(), ack_eliciting())
        .unwrap();

    let r = pipe.server.backrefs().attach();

    // Connections created after a walk started are skipped by it.
    let walker = backref::next_epoch();
    assert!(pipe.server.backrefs().visible_to(walker));

    let fresh = accept_server(&config());
    assert!(!fresh.backrefs().visible_to(walker));

    pipe.server.close(false, 0, b"").unwrap();

    let mut out = [0; 1500];
    pipe.server.send_close(&mut out, pipe.now).unwrap();

    assert!(!r.is_detached());

    let Pipe { server, .. } = pipe;

    assert!(server.into_closing().is_ok());
    assert!(r.is_detached());
}

#[test]
fn close_blocked_by_amplification() {
    let mut server = accept_server(&config());

    server.close(false, 0, b"").unwrap();

    let mut out = [0; 1500];

    // Nothing was received from the client, nothing can be sent.
    assert_eq!(server.send_close(&mut out, Instant::now()), Err(Error::Done));
    assert_eq!(server.close_state(), CloseState::ImmediateClose);

    assert!(server.into_closing().is_err());
}

#[test]
fn connection_is_send() {
    fn is_send<T: Send>() {}

    is_send::<Connection>();
    is_send::<ClosingConnection>();
}
