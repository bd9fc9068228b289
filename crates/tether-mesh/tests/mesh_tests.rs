#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tether_config::{ConfigLoader, GlareRule, TetherConfig};
    use tether_core::*;
    use tether_mesh::*;

    // ── Helpers ────────────────────────────────────────────────

    fn peer_with(network: &LoopbackNetwork, id: &str, config: TetherConfig) -> LocalPeer {
        LocalPeer::builder(
            Arc::new(network.clone()),
            Arc::new(config.peer.glare_rule),
        )
        .id(id)
        .config(config)
        .media_source(Arc::new(SyntheticMediaSource::new()))
        .build()
    }

    fn peer(network: &LoopbackNetwork, id: &str) -> LocalPeer {
        peer_with(network, id, TetherConfig::default())
    }

    fn quiet_peer(network: &LoopbackNetwork, id: &str) -> LocalPeer {
        let mut config = TetherConfig::default();
        config.peer.announce_peers = false;
        peer_with(network, id, config)
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn connected(local: &LocalPeer, remote: &LocalPeer) -> bool {
        local
            .connection(remote.id())
            .is_some_and(|c| c.is_connected())
    }

    fn receiving(local: &LocalPeer, remote: &LocalPeer, stream: &StreamId) -> bool {
        local
            .connection(remote.id())
            .is_some_and(|c| c.inbound_streams().iter().any(|s| s.id() == stream))
    }

    /// Bootstrap `offerer` and `answerer` through the out-of-band exchange.
    async fn pair(offerer: &LocalPeer, answerer: &LocalPeer) {
        let offer = offerer.get_first_offer().await.unwrap();
        let answer = answerer
            .set_first_offer_or_answer(offer)
            .await
            .unwrap()
            .expect("offer must yield an answer");
        assert!(offerer.set_first_offer_or_answer(answer).await.unwrap().is_none());
        wait_until("pair to connect", || {
            connected(offerer, answerer) && connected(answerer, offerer)
        })
        .await;
    }

    fn test_stream() -> MediaStream {
        MediaStream::new(vec![
            Arc::new(MediaTrack::new(TrackKind::Audio, "mic")),
            Arc::new(MediaTrack::new(TrackKind::Video, "cam")),
        ])
    }

    // ── Bootstrap ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_first_offer_is_pending_connection() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        let offer = x.get_first_offer().await.unwrap();
        assert_eq!(offer.from_id.as_str(), "x");
        assert!(offer.description.is_offer());

        let connection = x.connection(&offer.connection_id).unwrap();
        assert!(connection.is_pending());
        assert_eq!(connection.states().signaling, SignalingState::HaveLocalOffer);
        assert_eq!(connection.states().ice_gathering, IceGatheringState::Complete);
    }

    #[tokio::test]
    async fn test_bootstrap_handshake_rekeys_and_connects() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        let mut x_events = x.events().subscribe();

        let offer = x.get_first_offer().await.unwrap();
        let placeholder = offer.connection_id.clone();

        let answer = y.set_first_offer_or_answer(offer).await.unwrap().unwrap();
        assert_eq!(answer.from_id.as_str(), "y");
        assert_eq!(answer.connection_id, placeholder);
        assert!(answer.description.is_answer());

        assert!(x.set_first_offer_or_answer(answer).await.unwrap().is_none());
        wait_until("handshake", || connected(&x, &y) && connected(&y, &x)).await;

        assert_eq!(x.connection_ids(), vec![PeerId::new("y")]);
        assert_eq!(y.connection_ids(), vec![PeerId::new("x")]);
        assert!(x.connection(&placeholder).is_none());
        assert!(!x.connection(y.id()).unwrap().is_pending());

        let mut rekeyed = false;
        while let Ok(event) = x_events.try_recv() {
            if let Event::ConnectionRekeyed { from, to } = event {
                assert_eq!(from, placeholder);
                assert_eq!(to.as_str(), "y");
                rekeyed = true;
            }
        }
        assert!(rekeyed);
    }

    #[tokio::test]
    async fn test_connected_states_snapshot() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        let states = x.connection(y.id()).unwrap().states();
        assert_eq!(states.connection, ConnectionState::Connected);
        assert_eq!(states.signaling, SignalingState::Stable);
        assert_eq!(states.ice_connection, IceConnectionState::Connected);
        assert!(states.to_string().contains("Signaling: stable"));
    }

    #[tokio::test]
    async fn test_control_channels_open_after_connect() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        let info = x.connection(y.id()).unwrap().info();
        assert_eq!(info.open_channels, vec!["sdp", "id"]);
        assert!(!info.pending);
    }

    #[tokio::test]
    async fn test_answer_for_unknown_connection() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        let err = x
            .set_first_offer_or_answer(FirstDescription {
                from_id: PeerId::new("y"),
                connection_id: PeerId::new("never-issued"),
                description: SessionDescription::answer("{}"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn test_answer_claiming_local_identity_conflicts() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let offer = x.get_first_offer().await.unwrap();

        let err = x
            .set_first_offer_or_answer(FirstDescription {
                from_id: PeerId::new("x"),
                connection_id: offer.connection_id,
                description: SessionDescription::answer("{}"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::IdentityConflict(_)));
    }

    #[tokio::test]
    async fn test_answer_naming_identified_connection_leaves_it_alone() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        let err = x
            .set_first_offer_or_answer(FirstDescription {
                from_id: PeerId::new("z"),
                connection_id: PeerId::new("y"),
                description: SessionDescription::answer("{}"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::UnknownConnection(_)));
        assert_eq!(x.connection_ids(), vec![PeerId::new("y")]);
        assert!(x.connection(&PeerId::new("z")).is_none());
        assert!(connected(&x, &y));
    }

    #[tokio::test]
    async fn test_offer_from_local_identity_conflicts() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let offer = x.get_first_offer().await.unwrap();

        let err = x.set_first_offer_or_answer(offer).await.unwrap_err();
        assert!(matches!(err, TetherError::IdentityConflict(_)));
    }

    #[tokio::test]
    async fn test_direct_pairing() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");

        let offer = x.direct_offer().await.unwrap();
        assert_eq!(offer.id.as_str(), "x");
        let answer = y.accept_direct(offer).await.unwrap().unwrap();
        assert_eq!(answer.id.as_str(), "y");
        assert!(x.accept_direct(answer).await.unwrap().is_none());

        wait_until("direct pair", || connected(&x, &y) && connected(&y, &x)).await;
    }

    #[tokio::test]
    async fn test_second_direct_offer_replaces_first() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        x.direct_offer().await.unwrap();
        x.direct_offer().await.unwrap();
        assert_eq!(x.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_direct_answer_from_connected_identity_conflicts() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        x.direct_offer().await.unwrap();
        let err = x
            .accept_direct(DirectDescription {
                id: PeerId::new("y"),
                description: SessionDescription::answer("{}"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::IdentityConflict(_)));
        assert!(connected(&x, &y));
    }

    #[tokio::test]
    async fn test_direct_answer_without_offer() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        let err = x
            .accept_direct(DirectDescription {
                id: PeerId::new("y"),
                description: SessionDescription::answer("{}"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::UnknownConnection(_)));
    }

    // ── Registry ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_add_connection_rejects_duplicates_and_self() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        assert!(x.add_connection(Some(PeerId::new("y"))).await.unwrap().is_some());
        assert!(x.add_connection(Some(PeerId::new("y"))).await.unwrap().is_none());
        assert!(x.add_connection(Some(PeerId::new("x"))).await.unwrap().is_none());
        assert_eq!(x.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_known_identity_gets_conflict_policy() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        let known = x.add_connection(Some(PeerId::new("y"))).await.unwrap().unwrap();
        assert_eq!(known.conflict_policy(), Some(ConflictPolicy::Refuse));

        let pending = x.add_connection(None).await.unwrap().unwrap();
        assert_eq!(pending.conflict_policy(), None);
    }

    #[tokio::test]
    async fn test_remove_connection_closes_both_sides() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;
        let mut y_events = y.events().subscribe();

        assert!(x.remove_connection(y.id()).await);
        assert!(!x.remove_connection(y.id()).await);
        wait_until("remote removal", || {
            y.connection_count() == 0 && network.session_count() == 0
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut reason = None;
        while let Ok(event) = y_events.try_recv() {
            if let Event::ConnectionRemoved { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(RemovalReason::SessionTerminated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_removed_after_timeout() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let mut events = x.events().subscribe();

        x.add_connection(None).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(x.connection_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(x.connection_count(), 0);

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let Event::ConnectionRemoved { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(RemovalReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_swapped_shared_config_applies_to_later_connections() {
        let network = LoopbackNetwork::new();
        let shared = ConfigLoader::from_config(TetherConfig::default()).shared();
        let x = LocalPeer::builder(
            Arc::new(network.clone()),
            Arc::new(GlareRule::LowerIdRefuses),
        )
        .id("x")
        .shared_config(Arc::clone(&shared))
        .build();

        x.add_connection(Some(PeerId::new("early"))).await.unwrap().unwrap();
        shared.write().peer.idle_timeout_secs = 5;
        assert_eq!(x.config().peer.idle_timeout_secs, 5);
        x.add_connection(Some(PeerId::new("late"))).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(x.connection(&PeerId::new("late")).is_none());
        assert!(x.connection(&PeerId::new("early")).is_some());

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(x.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_connection_survives_idle_timeout() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(connected(&x, &y));
        assert!(connected(&y, &x));
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;
        let stream = test_stream();
        x.add_stream(stream.clone()).await.unwrap();

        x.shutdown().await;
        assert_eq!(x.connection_count(), 0);
        assert!(x.streams().is_empty());
        assert!(stream.is_stopped());
    }

    // ── Streams ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_add_stream_is_idempotent() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        let stream = test_stream();
        assert!(x.add_stream(stream.clone()).await.unwrap());
        assert!(!x.add_stream(stream.clone()).await.unwrap());

        let connection = x.connection(y.id()).unwrap();
        assert!(!connection.add_stream(&stream).await.unwrap());
        assert_eq!(connection.outbound_streams().len(), 1);

        wait_until("remote stream", || receiving(&y, &x, stream.id())).await;
        assert_eq!(y.connection(x.id()).unwrap().inbound_streams().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_added_before_connect_is_deferred() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        let stream = test_stream();
        x.add_stream(stream.clone()).await.unwrap();

        let offer = x.get_first_offer().await.unwrap();
        let pending = x.connection(&offer.connection_id).unwrap();
        assert!(pending.outbound_streams().is_empty());

        let answer = y.set_first_offer_or_answer(offer).await.unwrap().unwrap();
        x.set_first_offer_or_answer(answer).await.unwrap();

        wait_until("deferred stream", || receiving(&y, &x, stream.id())).await;
        assert!(x.connection(y.id()).unwrap().is_sending(stream.id()));
    }

    #[tokio::test]
    async fn test_stream_on_unconnected_connection_waits() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let connection = x.add_connection(Some(PeerId::new("y"))).await.unwrap().unwrap();

        let stream = test_stream();
        assert!(connection.add_stream(&stream).await.unwrap());
        assert_eq!(connection.outbound_streams(), vec![stream.id().clone()]);
        assert!(!connection.is_sending(stream.id()));
    }

    #[tokio::test]
    async fn test_remove_stream_detaches_and_stops() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;

        let stream = test_stream();
        x.add_stream(stream.clone()).await.unwrap();
        wait_until("remote stream", || receiving(&y, &x, stream.id())).await;

        assert!(x.remove_stream(stream.id()).await.unwrap());
        assert!(!x.remove_stream(stream.id()).await.unwrap());
        assert!(stream.is_stopped());
        assert!(x.connection(y.id()).unwrap().outbound_streams().is_empty());

        wait_until("remote stream removal", || !receiving(&y, &x, stream.id())).await;
    }

    #[tokio::test]
    async fn test_set_stream_enabled() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let stream = test_stream();
        x.add_stream(stream.clone()).await.unwrap();

        assert!(x.set_stream_enabled(stream.id(), false));
        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
        assert!(x.set_stream_enabled(stream.id(), true));
        assert!(stream.tracks().iter().all(|t| t.is_enabled()));
        assert!(!x.set_stream_enabled(&StreamId::new("missing"), false));
    }

    #[tokio::test]
    async fn test_add_user_and_display_streams() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");

        let user = x.add_user_stream().await.unwrap();
        let display = x.add_display_stream().await.unwrap();
        assert_eq!(user.tracks().len(), 2);
        assert_eq!(display.tracks().len(), 1);
        assert_eq!(x.streams().len(), 2);
    }

    #[tokio::test]
    async fn test_denied_media_adds_nothing() {
        let network = LoopbackNetwork::new();
        let x = LocalPeer::builder(
            Arc::new(network.clone()),
            Arc::new(GlareRule::LowerIdRefuses),
        )
        .media_source(Arc::new(SyntheticMediaSource::denied("no camera")))
        .build();

        let err = x.add_user_stream().await.unwrap_err();
        assert!(matches!(err, TetherError::MediaUnavailable(_)));
        assert!(x.streams().is_empty());
    }

    #[tokio::test]
    async fn test_no_media_source_configured() {
        let network = LoopbackNetwork::new();
        let x = LocalPeer::builder(
            Arc::new(network.clone()),
            Arc::new(GlareRule::LowerIdRefuses),
        )
        .build();
        assert!(matches!(
            x.add_display_stream().await.unwrap_err(),
            TetherError::MediaUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_track_with_two_streams_is_rejected() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let connection = x.add_connection(Some(PeerId::new("y"))).await.unwrap().unwrap();

        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let err = connection
            .on_track(&track, &[test_stream(), test_stream()])
            .unwrap_err();
        assert!(matches!(err, TetherError::UnexpectedMultiStreamEvent(2)));
        assert!(err.is_contract_violation());

        let err = connection.on_track(&track, &[]).unwrap_err();
        assert!(matches!(err, TetherError::UnexpectedMultiStreamEvent(0)));
        assert!(connection.inbound_streams().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_track_for_same_stream_counted_once() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let connection = x.add_connection(Some(PeerId::new("y"))).await.unwrap().unwrap();

        let stream = test_stream();
        let tracks = stream.tracks().to_vec();
        assert!(connection.on_track(&tracks[0], &[stream.clone()]).unwrap().is_some());
        assert!(connection.on_track(&tracks[1], &[stream.clone()]).unwrap().is_none());
        assert_eq!(connection.inbound_streams().len(), 1);

        assert!(connection.on_track_removed(stream.id()));
        assert!(!connection.on_track_removed(stream.id()));
    }

    // ── Negotiation ────────────────────────────────────────────

    #[tokio::test]
    async fn test_answer_in_stable_state_is_contract_violation() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let connection = x.add_connection(Some(PeerId::new("y"))).await.unwrap().unwrap();

        let err = connection
            .receive_offer_or_answer(SessionDescription::answer("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidDescriptionType { .. }));
    }

    #[tokio::test]
    async fn test_glare_refused_by_lower_identity() {
        let network = LoopbackNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");

        // Both sides open connections to each other and offer at once.
        let a_to_b = a.add_connection(Some(PeerId::new("b"))).await.unwrap().unwrap();
        let b_to_a = b.add_connection(Some(PeerId::new("a"))).await.unwrap().unwrap();
        let a_offer = a_to_b.create_offer().await.unwrap();
        let b_offer = b_to_a.create_offer().await.unwrap();

        // "a" sorts first and refuses; "b" rolls back and answers.
        assert!(a_to_b.receive_offer_or_answer(b_offer).await.unwrap().is_none());
        assert_eq!(a_to_b.states().signaling, SignalingState::HaveLocalOffer);

        let answer = b_to_a.receive_offer_or_answer(a_offer).await.unwrap().unwrap();
        assert!(answer.is_answer());
        assert!(a_to_b.receive_offer_or_answer(answer).await.unwrap().is_none());

        wait_until("glare resolution", || connected(&a, &b) && connected(&b, &a)).await;
    }

    #[tokio::test]
    async fn test_higher_id_refuses_rule() {
        let network = LoopbackNetwork::new();
        let mut config = TetherConfig::default();
        config.peer.glare_rule = GlareRule::HigherIdRefuses;
        let a = peer_with(&network, "a", config.clone());
        let b = peer_with(&network, "b", config);

        let a_to_b = a.add_connection(Some(PeerId::new("b"))).await.unwrap().unwrap();
        let b_to_a = b.add_connection(Some(PeerId::new("a"))).await.unwrap().unwrap();
        assert_eq!(a_to_b.conflict_policy(), Some(ConflictPolicy::Accept));
        assert_eq!(b_to_a.conflict_policy(), Some(ConflictPolicy::Refuse));
    }

    #[tokio::test]
    async fn test_multi_track_stream_negotiated_in_one_offer() {
        let network = LoopbackNetwork::new();
        let x = peer(&network, "x");
        let y = peer(&network, "y");
        pair(&x, &y).await;
        let before = network.offers_created();

        let stream = test_stream();
        x.add_stream(stream.clone()).await.unwrap();
        wait_until("remote stream", || receiving(&y, &x, stream.id())).await;
        wait_until("stable signaling", || {
            x.connection(y.id()).unwrap().states().signaling == SignalingState::Stable
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(network.offers_created() - before, 1);
        let inbound = y.connection(x.id()).unwrap().inbound_streams();
        assert_eq!(inbound[0].tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_simultaneous_renegotiation_converges() {
        let network = LoopbackNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        pair(&a, &b).await;

        let a_stream = test_stream();
        let b_stream = test_stream();
        a.add_stream(a_stream.clone()).await.unwrap();
        b.add_stream(b_stream.clone()).await.unwrap();

        wait_until("both streams", || {
            receiving(&b, &a, a_stream.id()) && receiving(&a, &b, b_stream.id())
        })
        .await;
        wait_until("stable signaling", || {
            a.connection(b.id()).unwrap().states().signaling == SignalingState::Stable
                && b.connection(a.id()).unwrap().states().signaling == SignalingState::Stable
        })
        .await;
    }

    // ── Relay & discovery ──────────────────────────────────────

    #[tokio::test]
    async fn test_relay_preserves_originator() {
        let network = LoopbackNetwork::new();
        let a = quiet_peer(&network, "a");
        let b = quiet_peer(&network, "b");
        let c = quiet_peer(&network, "c");
        pair(&a, &b).await;
        pair(&c, &b).await;
        let mut b_events = b.events().subscribe();

        // a negotiates with c through b.
        let a_to_c = a.add_connection(Some(PeerId::new("c"))).await.unwrap().unwrap();
        let offer = a_to_c.create_offer().await.unwrap();
        let via = a.connection(b.id()).unwrap();
        assert!(
            via.send(ChannelLabel::Description, &offer, Some(PeerId::new("c")))
                .await
                .unwrap()
        );

        wait_until("relayed link", || connected(&a, &c) && connected(&c, &a)).await;

        let mut relayed = Vec::new();
        while let Ok(event) = b_events.try_recv() {
            if let Event::MessageRelayed { label, from, to } = event {
                relayed.push((label, from.to_string(), to.to_string()));
            }
        }
        assert!(relayed.contains(&("sdp".into(), "a".into(), "c".into())));
        assert!(relayed.contains(&("sdp".into(), "c".into(), "a".into())));
        assert_eq!(b.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_relay_to_unknown_destination_is_dropped() {
        let network = LoopbackNetwork::new();
        let a = quiet_peer(&network, "a");
        let b = quiet_peer(&network, "b");
        pair(&a, &b).await;
        let mut b_events = b.events().subscribe();

        let via = a.connection(b.id()).unwrap();
        via.send(
            ChannelLabel::Description,
            &SessionDescription::offer("{}"),
            Some(PeerId::new("nobody")),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = b_events.try_recv() {
            assert!(!matches!(event, Event::MessageRelayed { .. }));
        }
        assert!(connected(&a, &b));
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_mesh_closes_through_discovery() {
        let network = LoopbackNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let c = peer(&network, "c");

        pair(&a, &b).await;
        pair(&c, &b).await;

        wait_until("full mesh", || {
            connected(&a, &c) && connected(&c, &a) && connected(&a, &b) && connected(&c, &b)
        })
        .await;
        for p in [&a, &b, &c] {
            assert_eq!(p.connection_count(), 2);
        }
    }

    #[tokio::test]
    async fn test_four_peer_mesh() {
        let network = LoopbackNetwork::new();
        let peers: Vec<LocalPeer> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|id| peer(&network, id))
            .collect();

        // Each newcomer pairs with the previous peer only, once the
        // existing group is fully meshed.
        for joined in 2..=peers.len() {
            pair(&peers[joined - 1], &peers[joined - 2]).await;
            let group = &peers[..joined];
            wait_until("group mesh", || {
                group.iter().all(|p| {
                    p.connection_count() == joined - 1
                        && p.connections().iter().all(|c| c.is_connected())
                })
            })
            .await;
        }
    }

    #[tokio::test]
    async fn test_stream_reaches_peer_found_by_discovery() {
        let network = LoopbackNetwork::new();
        let a = peer(&network, "a");
        let b = peer(&network, "b");
        let c = peer(&network, "c");
        let stream = test_stream();
        a.add_stream(stream.clone()).await.unwrap();

        pair(&a, &b).await;
        pair(&c, &b).await;

        wait_until("stream over discovered link", || receiving(&c, &a, stream.id())).await;
    }
}
