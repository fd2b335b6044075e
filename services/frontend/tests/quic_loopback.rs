//! QUIC loopback tests for the three front-end variants.
//!
//! Each test binds an ephemeral listener with a self-signed certificate and talks to it
//! with a real QUIC client using the length-prefixed message codec.
mod common;

use anyhow::{Context, Result};
use broker_transport::tls::{client_config_trusting, self_signed_server_config};
use broker_transport::{QuicClient, QuicConnection, TransportConfig};
use broker_wire::{FaultCode, Message};
use bytes::BytesMut;
use common::*;
use frontend::client::PipelineMode;
use frontend::transport::quic::codec::{read_message, write_message};
use frontend::transport::quic::{
    DEFAULT_MAX_FRAME_BYTES, QuicDuplexListener, QuicEndpointConfig, QuicIngressQueue,
    QuicReplyListener,
};
use frontend::{
    DuplexFrontEnd, FrontEnd, FrontEndSettings, PollingFrontEnd, RequestReplyFrontEnd,
};
use rustls::pki_types::CertificateDer;
use serial_test::serial;
use std::net::SocketAddr;

fn endpoint() -> Result<(QuicEndpointConfig, CertificateDer<'static>)> {
    let (server_config, cert) = self_signed_server_config()?;
    let bind: SocketAddr = "127.0.0.1:0".parse()?;
    Ok((QuicEndpointConfig::new(bind, server_config), cert))
}

// The client endpoint is returned so it outlives the connection.
async fn connect(
    addr: SocketAddr,
    cert: CertificateDer<'static>,
) -> Result<(QuicClient, QuicConnection)> {
    let client = QuicClient::bind(
        "127.0.0.1:0".parse()?,
        client_config_trusting(cert)?,
        TransportConfig::default(),
    )?;
    let connection = client.connect(addr, "localhost").await?;
    Ok((client, connection))
}

async fn exchange(connection: &QuicConnection, request: &Message) -> Result<Message> {
    let (mut send, mut recv) = connection.open_bi().await?;
    write_message(&mut send, request, DEFAULT_MAX_FRAME_BYTES).await?;
    send.finish()?;
    let mut scratch = BytesMut::new();
    read_message(&mut recv, DEFAULT_MAX_FRAME_BYTES, &mut scratch)
        .await?
        .context("reply before end of stream")
}

#[tokio::test]
#[serial]
async fn duplex_session_over_quic() -> Result<()> {
    let registry = registry(PipelineMode::Echo);
    let (config, cert) = endpoint()?;
    let front_end =
        DuplexFrontEnd::open(QuicDuplexListener::new(config), context(&registry)).await?;
    let addr = front_end.listener().local_addr().context("bound address")?;

    let (_client, connection) = connect(addr, cert).await?;
    let (mut send, mut recv) = connection.open_bi().await?;
    let mut scratch = BytesMut::new();
    for body in ["one", "two"] {
        let request = request_for("AB-12", body);
        write_message(&mut send, &request, DEFAULT_MAX_FRAME_BYTES).await?;
        let reply = within(read_message(&mut recv, DEFAULT_MAX_FRAME_BYTES, &mut scratch))
            .await?
            .context("reply")?;
        assert_eq!(reply.relates_to, request.message_id);
        assert_eq!(reply.body.as_ref(), body.as_bytes());
    }

    let mismatch = request_for("CD-34", "three");
    write_message(&mut send, &mismatch, DEFAULT_MAX_FRAME_BYTES).await?;
    let fault = within(read_message(&mut recv, DEFAULT_MAX_FRAME_BYTES, &mut scratch))
        .await?
        .context("fault")?;
    assert_eq!(fault.fault.map(|detail| detail.code), Some(FaultCode::ClientIdMismatch));

    front_end.close();
    Ok(())
}

#[tokio::test]
#[serial]
async fn request_reply_over_quic() -> Result<()> {
    let registry = registry(PipelineMode::Echo);
    let (config, cert) = endpoint()?;
    let front_end =
        RequestReplyFrontEnd::open(QuicReplyListener::new(config), context(&registry)).await?;
    let addr = front_end.listener().local_addr().context("bound address")?;
    let (_client, connection) = connect(addr, cert).await?;

    let request = request_for("AB-12", "ping");
    let reply = within(exchange(&connection, &request)).await?;
    assert_eq!(reply.body.as_ref(), b"ping");
    assert_eq!(reply.relates_to, request.message_id);

    let invalid = request_for(&"x".repeat(300), "ping");
    let fault = within(exchange(&connection, &invalid)).await?;
    assert_eq!(fault.fault.map(|detail| detail.code), Some(FaultCode::InvalidClientId));

    front_end.close();
    Ok(())
}

#[tokio::test]
#[serial]
async fn ingress_streams_feed_the_poll_loops() -> Result<()> {
    let registry = registry(PipelineMode::Buffer);
    let (config, cert) = endpoint()?;
    // One poll loop keeps arrival order observable.
    let context = context(&registry).with_settings(FrontEndSettings {
        accept_loops: Some(1),
        ..settings()
    });
    let front_end = PollingFrontEnd::open(QuicIngressQueue::new(config), context).await?;
    let addr = front_end.queue().local_addr().context("bound address")?;
    let (_client, connection) = connect(addr, cert).await?;

    let mut send = connection.open_uni().await?;
    for body in ["a", "b", "c"] {
        write_message(&mut send, &request_for("AB-12", body), DEFAULT_MAX_FRAME_BYTES).await?;
    }
    send.finish()?;

    let client = pipeline(&registry, "AB-12").await;
    eventually(|| client.received_total() == 3).await;
    let bodies: Vec<_> = client
        .take_pending()
        .into_iter()
        .map(|pending| pending.request.body)
        .collect();
    assert_eq!(bodies, ["a", "b", "c"].map(|body| body.as_bytes()));

    front_end.close();
    Ok(())
}

#[tokio::test]
#[serial]
async fn throttled_ingress_is_held_at_queue_depth() -> Result<()> {
    let registry = registry(PipelineMode::Buffer);
    let (config, cert) = endpoint()?;
    let context = context(&registry).with_settings(FrontEndSettings {
        accept_loops: Some(1),
        ..settings()
    });
    let queue = QuicIngressQueue::new(config).with_queue_depth(2);
    let front_end = PollingFrontEnd::open(queue, context).await?;
    let addr = front_end.queue().local_addr().context("bound address")?;
    let gate = front_end.core().gate().clone();
    gate.start_throttling();
    eventually(|| gate.deferred_len() == 1).await;

    let (_client, connection) = connect(addr, cert).await?;
    let mut send = connection.open_uni().await?;
    let bodies = ["a", "b", "c", "d", "e", "f"];
    for body in bodies {
        write_message(&mut send, &request_for("AB-12", body), DEFAULT_MAX_FRAME_BYTES).await?;
    }
    send.finish()?;

    eventually(|| front_end.queue().depth() == 2).await;
    tokio::time::sleep(SHORT).await;
    assert_eq!(front_end.queue().depth(), 2);
    assert!(registry.is_empty());

    gate.stop_throttling();
    let client = pipeline(&registry, "AB-12").await;
    eventually(|| client.received_total() == bodies.len() as u64).await;
    let received: Vec<_> = client
        .take_pending()
        .into_iter()
        .map(|pending| pending.request.body)
        .collect();
    assert_eq!(received, bodies.map(|body| body.as_bytes()));

    front_end.close();
    Ok(())
}
