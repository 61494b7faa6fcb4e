//! The serial I/O worker that owns a broker session.
//!
//! Each session gets its own OS thread running a current-thread runtime.
//! The transport is created on that thread and never leaves it; every
//! channel operation (consume, ack, nack, publish, close) is funnelled
//! through the worker's queues and executed one at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::stats::ConnectionCounters;
use crate::transport::{
    BrokerTransport, DeliveryEvent, DeliveryStream, RawDelivery, ShutdownSignal, Topology,
    TransportSettings,
};

pub(crate) enum Control {
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckAction {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckOutcome {
    pub(crate) delivery_tag: u64,
    pub(crate) action: AckAction,
}

pub(crate) struct PublishRequest {
    pub(crate) payload: Vec<u8>,
    pub(crate) reply: oneshot::Sender<Result<(), BrokerError>>,
}

pub(crate) struct WorkerParams {
    pub(crate) settings: TransportSettings,
    pub(crate) topology: Topology,
    pub(crate) consumer_tag: String,
    pub(crate) prefetch: u16,
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) channel_open: Arc<AtomicBool>,
    pub(crate) counters: Arc<ConnectionCounters>,
}

pub(crate) struct WorkerChannels {
    pub(crate) control_rx: mpsc::UnboundedReceiver<Control>,
    pub(crate) ack_rx: mpsc::UnboundedReceiver<AckOutcome>,
    pub(crate) publish_rx: mpsc::Receiver<PublishRequest>,
    pub(crate) inbound_tx: mpsc::Sender<RawDelivery>,
    pub(crate) signal_tx: mpsc::UnboundedSender<ShutdownSignal>,
    pub(crate) ready_tx: oneshot::Sender<Result<(), BrokerError>>,
}

pub(crate) fn spawn_worker<T: BrokerTransport>(
    params: WorkerParams,
    channels: WorkerChannels,
) -> Result<JoinHandle<()>, BrokerError> {
    let name = format!("broker-io-{}", params.topology.inbound_queue);
    let handle = std::thread::Builder::new().name(name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                let _ = channels.ready_tx.send(Err(BrokerError::Io(error)));
                return;
            }
        };
        runtime.block_on(run_worker::<T>(params, channels));
    })?;
    Ok(handle)
}

async fn open_session<T: BrokerTransport>(
    params: &WorkerParams,
) -> Result<(T, DeliveryStream), BrokerError> {
    let mut transport = T::connect(&params.settings).await?;
    let opened = async {
        transport.declare_topology(&params.topology).await?;
        transport
            .consume(
                &params.topology.inbound_queue,
                &params.consumer_tag,
                params.prefetch,
            )
            .await
    }
    .await;

    match opened {
        Ok(stream) => Ok((transport, stream)),
        Err(error) => {
            if let Err(close_error) = transport.close().await {
                debug!(error = %close_error, "failed to close half-open session");
            }
            Err(error)
        }
    }
}

async fn run_worker<T: BrokerTransport>(params: WorkerParams, channels: WorkerChannels) {
    let WorkerChannels {
        mut control_rx,
        mut ack_rx,
        mut publish_rx,
        inbound_tx,
        signal_tx,
        ready_tx,
    } = channels;

    let (mut transport, stream) = match open_session::<T>(&params).await {
        Ok(opened) => opened,
        Err(error) => {
            let _ = ready_tx.send(Err(error));
            return;
        }
    };

    params.channel_open.store(true, Ordering::SeqCst);
    let pump = tokio::spawn(pump_deliveries(
        stream,
        inbound_tx,
        signal_tx,
        Arc::clone(&params.closing),
        Arc::clone(&params.channel_open),
        Arc::clone(&params.counters),
    ));

    if ready_tx.send(Ok(())).is_err() {
        // The connect attempt gave up waiting for us.
        pump.abort();
        params.closing.store(true, Ordering::SeqCst);
        close_transport(&mut transport, &params).await;
        return;
    }

    info!(
        queue = %params.topology.inbound_queue,
        consumer_tag = %params.consumer_tag,
        prefetch = params.prefetch,
        "broker session ready"
    );

    let reply = loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => {
                break match control {
                    Some(Control::Shutdown { reply }) => Some(reply),
                    None => None,
                };
            }
            Some(outcome) = ack_rx.recv() => settle(&mut transport, outcome, &params.counters).await,
            Some(request) = publish_rx.recv() => {
                let (exchange, routing_key) = params.topology.publish_target();
                let result = transport.publish(exchange, routing_key, &request.payload).await;
                let _ = request.reply.send(result);
            }
        }
    };

    params.closing.store(true, Ordering::SeqCst);
    ack_rx.close();
    publish_rx.close();
    while let Ok(outcome) = ack_rx.try_recv() {
        settle(&mut transport, outcome, &params.counters).await;
    }
    while let Ok(request) = publish_rx.try_recv() {
        let _ = request.reply.send(Err(BrokerError::ChannelClosed(
            "session shutting down".to_string(),
        )));
    }

    pump.abort();
    close_transport(&mut transport, &params).await;

    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

async fn pump_deliveries(
    mut stream: DeliveryStream,
    inbound_tx: mpsc::Sender<RawDelivery>,
    signal_tx: mpsc::UnboundedSender<ShutdownSignal>,
    closing: Arc<AtomicBool>,
    channel_open: Arc<AtomicBool>,
    counters: Arc<ConnectionCounters>,
) {
    let signal = loop {
        match stream.next().await {
            Some(DeliveryEvent::Delivery(delivery)) => {
                ConnectionCounters::bump(&counters.deliveries_received);
                if inbound_tx.send(delivery).await.is_err() {
                    break None;
                }
            }
            Some(DeliveryEvent::Shutdown(signal)) => break Some(signal),
            None => {
                break Some(ShutdownSignal {
                    graceful: false,
                    reason: "delivery stream ended".to_string(),
                });
            }
        }
    };

    channel_open.store(false, Ordering::SeqCst);
    if let Some(signal) = signal {
        if !closing.load(Ordering::SeqCst) {
            let _ = signal_tx.send(signal);
        }
    }
}

async fn settle<T: BrokerTransport>(
    transport: &mut T,
    outcome: AckOutcome,
    counters: &ConnectionCounters,
) {
    let result = match outcome.action {
        AckAction::Ack => transport.ack(outcome.delivery_tag).await,
        AckAction::Nack { requeue } => transport.nack(outcome.delivery_tag, requeue).await,
    };

    match result {
        Ok(()) => match outcome.action {
            AckAction::Ack => ConnectionCounters::bump(&counters.deliveries_acked),
            AckAction::Nack { .. } => ConnectionCounters::bump(&counters.deliveries_nacked),
        },
        Err(error) => warn!(
            delivery_tag = outcome.delivery_tag,
            %error,
            "failed to settle delivery"
        ),
    }
}

async fn close_transport<T: BrokerTransport>(transport: &mut T, params: &WorkerParams) {
    if transport.is_open() {
        if let Err(error) = transport.cancel_consumer(&params.consumer_tag).await {
            debug!(%error, "failed to cancel consumer");
        }
        if let Err(error) = transport.close().await {
            debug!(%error, "failed to close broker session");
        }
    }
    params.channel_open.store(false, Ordering::SeqCst);
    debug!(queue = %params.topology.inbound_queue, "broker session closed");
}
