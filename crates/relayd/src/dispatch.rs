use crate::broker::OutboundBroker;
use crate::dns::MxResolver;
use crate::lifecycle::{is_shutting_down, Activity, ShutdownSubscription};
use crate::message::{EnvelopeAddress, QueuedMessage};
use crate::pool::{ClientPool, LeaseOutcome, PooledClient};
use crate::recorder::{self, DispositionRecorder};
use crate::smtp::{StepDisposition, StepStatus, TransportError};
use crate::unavailability::UnavailabilityRegistry;
use crate::virtual_mta::GroupRegistry;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How a non-success peer reply steers the rest of the transaction
enum PeerFailure {
    /// 5xx: the peer will never take this message
    Permanent(String),
    /// 421: the peer wants us to go away for a while
    Unavailable(String),
    /// Anything else: try again later
    Transient(String),
}

fn classify_reply(reply: &str) -> PeerFailure {
    if reply.starts_with('5') {
        PeerFailure::Permanent(reply.to_string())
    } else if reply.starts_with("421") {
        PeerFailure::Unavailable(reply.to_string())
    } else {
        PeerFailure::Transient(reply.to_string())
    }
}

pub struct MessageSenderParams {
    pub broker: Arc<dyn OutboundBroker>,
    pub resolver: Arc<dyn MxResolver>,
    pub groups: Arc<GroupRegistry>,
    pub pool: Arc<dyn ClientPool>,
    pub recorder: Arc<DispositionRecorder>,
    pub registry: Arc<UnavailabilityRegistry>,
    pub max_time_in_queue: chrono::Duration,
    pub idle_sleep: Duration,
}

/// The dispatch loop: drains the broker, applies the timing and policy
/// gates, selects routing, and drives each message through one SMTP
/// transaction attempt.
pub struct MessageSender {
    broker: Arc<dyn OutboundBroker>,
    resolver: Arc<dyn MxResolver>,
    groups: Arc<GroupRegistry>,
    pool: Arc<dyn ClientPool>,
    recorder: Arc<DispositionRecorder>,
    registry: Arc<UnavailabilityRegistry>,
    max_time_in_queue: chrono::Duration,
    idle_sleep: Duration,
    stop_tx: tokio::sync::watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSender {
    pub fn new(params: MessageSenderParams) -> Arc<Self> {
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            broker: params.broker,
            resolver: params.resolver,
            groups: params.groups,
            pool: params.pool,
            recorder: params.recorder,
            registry: params.registry,
            max_time_in_queue: params.max_time_in_queue,
            idle_sleep: params.idle_sleep,
            stop_tx,
            worker: Mutex::new(None),
        })
    }

    /// Launch the dispatch loop on its own worker task
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let activity = Activity::get()?;
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move { me.run_loop(activity).await });
        self.worker.lock().replace(handle);
        Ok(())
    }

    /// Signal cooperative shutdown and wait for the worker to finish.
    /// An in-flight transaction runs to completion first.
    pub async fn stop(&self) {
        self.stop_tx.send(true).ok();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
    }

    async fn run_loop(self: Arc<Self>, _activity: Activity) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut shutdown = ShutdownSubscription::get();
        tracing::info!("dispatch loop running");
        loop {
            if *stop_rx.borrow() || is_shutting_down() {
                break;
            }
            match self.broker.dequeue().await {
                Ok(Some(msg)) => {
                    // internal trouble must not kill the loop
                    if let Err(err) = self.dispatch_one(msg).await {
                        tracing::error!("dispatch attempt failed: {err:#}");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_sleep) => {}
                        _ = stop_rx.changed() => {}
                        _ = shutdown.shutting_down() => {}
                    }
                }
                Err(err) => {
                    // polling the broker is the only retried operation
                    tracing::error!("failed to poll the broker: {err:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.idle_sleep) => {}
                        _ = stop_rx.changed() => {}
                        _ = shutdown.shutting_down() => {}
                    }
                }
            }
        }
        tracing::info!("dispatch loop stopped");
    }

    /// One dispatch attempt for one exclusively-owned message
    async fn dispatch_one(&self, mut msg: QueuedMessage) -> anyhow::Result<()> {
        let now = Utc::now();

        // Not yet eligible: hand it back and let the broker decide the delay
        if msg.is_deferred(now) {
            return self.broker.enqueue(msg).await;
        }

        // Past the gate, this message is consuming a dispatch attempt;
        // every outcome recorded below carries its number
        msg.begin_attempt();

        if msg.exceeded_queue_budget(self.max_time_in_queue) {
            self.recorder
                .record_failure(&msg, recorder::TIMED_OUT_IN_QUEUE, None, None)
                .await?;
            return self.broker.ack(&msg).await;
        }

        let parsed = match (
            EnvelopeAddress::parse(&msg.sender),
            EnvelopeAddress::parse(&msg.recipient),
        ) {
            (Ok(sender), Ok(recipient)) if !recipient.domain().is_empty() => {
                Some((sender, recipient))
            }
            _ => None,
        };
        let Some((sender, recipient)) = parsed else {
            self.recorder
                .record_failure(&msg, recorder::DOMAIN_NOT_FOUND, None, None)
                .await?;
            return self.broker.ack(&msg).await;
        };

        let mx_records = match self.resolver.resolve_mx(recipient.domain()).await {
            Ok(records) => records,
            Err(err) => {
                tracing::debug!("MX resolution for {} failed: {err:#}", recipient.domain());
                vec![]
            }
        };
        if mx_records.is_empty() {
            self.recorder
                .record_failure(&msg, recorder::DOMAIN_NOT_FOUND, None, None)
                .await?;
            return self.broker.ack(&msg).await;
        }

        let group = self.groups.get_group(&msg.group);
        let mta = group.virtual_mta_for_sending(&mx_records[0]);

        match self.pool.lease(&mta, &mx_records).await {
            LeaseOutcome::Success(client) => {
                self.run_transaction(client, &msg, &sender, &recipient)
                    .await?;
                self.broker.ack(&msg).await
            }
            // Expected race outcomes: nothing to record, no ack;
            // the broker will redeliver
            LeaseOutcome::NoMxRecords
            | LeaseOutcome::FailedToAddToQueue
            | LeaseOutcome::Unknown => Ok(()),
            LeaseOutcome::FailedToConnect => {
                self.recorder
                    .record_deferral(
                        &msg,
                        recorder::FAILED_TO_CONNECT,
                        Some(mta.source_address),
                        Some(&mx_records[0].host),
                        false,
                    )
                    .await?;
                self.broker.ack(&msg).await
            }
            LeaseOutcome::ServiceUnavailable => {
                self.recorder
                    .record_service_unavailable(&msg, mta.source_address)
                    .await?;
                self.broker.ack(&msg).await
            }
            LeaseOutcome::Throttled => {
                self.recorder
                    .record_throttle(&msg, mta.source_address, &mx_records[0].host)
                    .await?;
                self.broker.ack(&msg).await
            }
            LeaseOutcome::FailedMaxConnections => {
                // In-memory nudge only; the broker redelivers on its
                // own schedule
                msg.delay_attempt_by(chrono::Duration::seconds(2));
                Ok(())
            }
        }
    }

    /// Drive the four transaction steps in strict order. The client
    /// goes back to the pool iff every step completed; any other exit
    /// discards it.
    async fn run_transaction(
        &self,
        mut client: PooledClient,
        msg: &QueuedMessage,
        sender: &EnvelopeAddress,
        recipient: &EnvelopeAddress,
    ) -> anyhow::Result<()> {
        let source_ip = client.source_ip;
        let mx_host = client.mx_host.clone();

        let mut peer_failure: Option<PeerFailure> = None;
        let mut failed = |reply: &str| {
            peer_failure = Some(classify_reply(reply));
            StepDisposition::Abort
        };

        let result = async {
            let c = client.client_mut();
            if c.exec_helo_or_rset(&mut failed).await? == StepStatus::Aborted {
                return Ok(StepStatus::Aborted);
            }
            if c.exec_mail_from(sender, &mut failed).await? == StepStatus::Aborted {
                return Ok(StepStatus::Aborted);
            }
            if c.exec_rcpt_to(recipient, &mut failed).await? == StepStatus::Aborted {
                return Ok(StepStatus::Aborted);
            }
            if c.exec_data(&msg.data, &mut failed).await? == StepStatus::Aborted {
                return Ok(StepStatus::Aborted);
            }
            Ok::<StepStatus, TransportError>(StepStatus::Complete)
        }
        .await;

        match result {
            Ok(StepStatus::Complete) => {
                self.pool.give_back(client).await;
                self.recorder
                    .record_success(msg, source_ip, &mx_host)
                    .await?;
            }
            Ok(StepStatus::Aborted) => {
                drop(client);
                match peer_failure.take() {
                    Some(PeerFailure::Permanent(reply)) => {
                        self.recorder
                            .record_failure(msg, &reply, Some(source_ip), Some(&mx_host))
                            .await?;
                    }
                    Some(PeerFailure::Unavailable(reply)) => {
                        self.registry.add(source_ip, &mx_host);
                        self.recorder
                            .record_deferral(msg, &reply, Some(source_ip), Some(&mx_host), true)
                            .await?;
                    }
                    Some(PeerFailure::Transient(reply)) => {
                        self.recorder
                            .record_deferral(msg, &reply, Some(source_ip), Some(&mx_host), false)
                            .await?;
                    }
                    None => {
                        self.recorder
                            .record_deferral(
                                msg,
                                recorder::ENDED_ABRUPTLY,
                                Some(source_ip),
                                Some(&mx_host),
                                false,
                            )
                            .await?;
                    }
                }
            }
            Err(err) => {
                drop(client);
                tracing::debug!("transaction with {mx_host} broke off: {err}");
                self.recorder
                    .record_deferral(
                        msg,
                        recorder::ENDED_ABRUPTLY,
                        Some(source_ip),
                        Some(&mx_host),
                        false,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::GroupConfig;
    use crate::dns::MxRecord;
    use crate::events::MemoryEventStore;
    use crate::lifecycle::LifeCycle;
    use crate::recorder::{DeliveryStatus, MemoryStatusStore};
    use crate::smtp::{FailedCallback, SmtpDelivery};
    use async_trait::async_trait;
    use relay_log_types::EventKind;
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SOURCE: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 0, 2, 1));
    const MX_HOST: &str = "mx1.example.com";

    #[derive(Clone, Copy)]
    enum Step {
        Accept,
        Reject(&'static str),
        Abrupt,
    }

    /// Plays back scripted replies and records which steps ran
    struct ScriptedClient {
        script: Vec<Step>,
        log: Arc<Mutex<Vec<&'static str>>>,
        cursor: usize,
    }

    impl ScriptedClient {
        fn step(
            &mut self,
            name: &'static str,
            failed: FailedCallback<'_>,
        ) -> Result<StepStatus, TransportError> {
            self.log.lock().push(name);
            let step = self.script.get(self.cursor).copied().unwrap_or(Step::Accept);
            self.cursor += 1;
            match step {
                Step::Accept => Ok(StepStatus::Complete),
                Step::Reject(reply) => Ok(match failed(reply) {
                    StepDisposition::Continue => StepStatus::Complete,
                    StepDisposition::Abort => StepStatus::Aborted,
                }),
                Step::Abrupt => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "peer went away",
                ))),
            }
        }
    }

    #[async_trait]
    impl SmtpDelivery for ScriptedClient {
        async fn exec_helo_or_rset(
            &mut self,
            failed: FailedCallback<'_>,
        ) -> Result<StepStatus, TransportError> {
            self.step("helo", failed)
        }
        async fn exec_mail_from(
            &mut self,
            _sender: &EnvelopeAddress,
            failed: FailedCallback<'_>,
        ) -> Result<StepStatus, TransportError> {
            self.step("mail_from", failed)
        }
        async fn exec_rcpt_to(
            &mut self,
            _recipient: &EnvelopeAddress,
            failed: FailedCallback<'_>,
        ) -> Result<StepStatus, TransportError> {
            self.step("rcpt_to", failed)
        }
        async fn exec_data(
            &mut self,
            _data: &[u8],
            failed: FailedCallback<'_>,
        ) -> Result<StepStatus, TransportError> {
            self.step("data", failed)
        }
    }

    enum PoolScript {
        Transaction(Vec<Step>),
        NoMxRecords,
        FailedToConnect,
        ServiceUnavailable,
        Throttled,
        FailedMaxConnections,
    }

    struct ScriptedPool {
        script: Mutex<VecDeque<PoolScript>>,
        steps: Arc<Mutex<Vec<&'static str>>>,
        leases: AtomicUsize,
        given_back: AtomicUsize,
    }

    impl ScriptedPool {
        fn new(script: Vec<PoolScript>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                steps: Arc::new(Mutex::new(Vec::new())),
                leases: AtomicUsize::new(0),
                given_back: AtomicUsize::new(0),
            })
        }

        fn steps(&self) -> Vec<&'static str> {
            self.steps.lock().clone()
        }

        fn lease_count(&self) -> usize {
            self.leases.load(Ordering::SeqCst)
        }

        fn given_back_count(&self) -> usize {
            self.given_back.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClientPool for ScriptedPool {
        async fn lease(
            &self,
            _mta: &crate::virtual_mta::VirtualMta,
            _mx_records: &[MxRecord],
        ) -> LeaseOutcome {
            self.leases.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(PoolScript::Transaction(script)) => {
                    let client = ScriptedClient {
                        script,
                        log: self.steps.clone(),
                        cursor: 0,
                    };
                    LeaseOutcome::Success(PooledClient::detached(
                        Box::new(client),
                        SOURCE,
                        MX_HOST,
                    ))
                }
                Some(PoolScript::NoMxRecords) => LeaseOutcome::NoMxRecords,
                Some(PoolScript::FailedToConnect) => LeaseOutcome::FailedToConnect,
                Some(PoolScript::ServiceUnavailable) => LeaseOutcome::ServiceUnavailable,
                Some(PoolScript::Throttled) => LeaseOutcome::Throttled,
                Some(PoolScript::FailedMaxConnections) => LeaseOutcome::FailedMaxConnections,
                None => LeaseOutcome::Unknown,
            }
        }

        async fn give_back(&self, _client: PooledClient) {
            self.given_back.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StaticResolver {
        records: Vec<MxRecord>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl crate::dns::MxResolver for StaticResolver {
        async fn resolve_mx(&self, _domain: &str) -> anyhow::Result<Vec<MxRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.clone())
        }
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        resolver: Arc<StaticResolver>,
        registry: Arc<UnavailabilityRegistry>,
        pool: Arc<ScriptedPool>,
        status: Arc<MemoryStatusStore>,
        events: Arc<MemoryEventStore>,
        sender: Arc<MessageSender>,
    }

    fn harness(mx_hosts: &[&str], pool_script: Vec<PoolScript>) -> Harness {
        let broker = Arc::new(MemoryBroker::default());
        let resolver = Arc::new(StaticResolver {
            records: mx_hosts
                .iter()
                .enumerate()
                .map(|(n, host)| MxRecord {
                    host: host.to_string(),
                    preference: 10 * (n as u16 + 1),
                })
                .collect(),
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(UnavailabilityRegistry::new());
        let pool = ScriptedPool::new(pool_script);
        let status = Arc::new(MemoryStatusStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let recorder = Arc::new(DispositionRecorder::new(status.clone(), events.clone()));
        let groups = Arc::new(
            GroupRegistry::from_config(&[GroupConfig {
                name: "default".to_string(),
                virtual_mtas: vec![crate::config::VirtualMtaConfig {
                    name: "vmta-1".to_string(),
                    source_address: SOURCE,
                    ehlo_hostname: "relay.example.com".to_string(),
                    remote_port: None,
                }],
            }])
            .unwrap(),
        );
        let sender = MessageSender::new(MessageSenderParams {
            broker: broker.clone(),
            resolver: resolver.clone(),
            groups,
            pool: pool.clone(),
            recorder,
            registry: registry.clone(),
            max_time_in_queue: chrono::Duration::minutes(60),
            idle_sleep: Duration::from_millis(5),
        });
        Harness {
            broker,
            resolver,
            registry,
            pool,
            status,
            events,
            sender,
        }
    }

    fn message() -> QueuedMessage {
        QueuedMessage::new(
            "from@here.com",
            "user@example.com",
            b"Subject: hi\r\n\r\nbody\r\n".to_vec(),
            "default",
        )
    }

    /// Run one dispatch attempt for a message that came off the broker
    async fn dispatch(h: &Harness, msg: QueuedMessage) -> QueuedMessage {
        h.broker.submit(msg);
        let leased = h.broker.dequeue().await.unwrap().unwrap();
        h.sender.dispatch_one(leased.clone()).await.unwrap();
        leased
    }

    #[tokio::test]
    async fn clean_send_records_one_success_and_returns_the_client() {
        let h = harness(&[MX_HOST], vec![PoolScript::Transaction(vec![])]);
        let msg = dispatch(&h, message()).await;

        k9::assert_equal!(h.pool.steps(), vec!["helo", "mail_from", "rcpt_to", "data"]);
        assert_eq!(h.pool.given_back_count(), 1);

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, DeliveryStatus::Delivered);
        assert_eq!(updates[0].mx_host.as_deref(), Some(MX_HOST));
        assert_eq!(updates[0].attempt, 1);

        // acked: the broker is fully drained
        assert_eq!(h.broker.in_flight(), 0);
        assert_eq!(h.broker.pending(), 0);
    }

    #[tokio::test]
    async fn no_mx_is_a_permanent_failure_without_any_network_io() {
        let h = harness(&[], vec![]);
        let msg = dispatch(&h, message()).await;

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, DeliveryStatus::Failed);
        assert_eq!(updates[0].reason.as_deref(), Some(recorder::DOMAIN_NOT_FOUND));
        assert_eq!(h.pool.lease_count(), 0);

        let events = h.events.all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Bounce);
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn unparsable_recipient_is_a_permanent_failure() {
        let h = harness(&[MX_HOST], vec![]);
        let mut msg = message();
        msg.recipient = "not-an-address".to_string();
        let msg = dispatch(&h, msg).await;

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates[0].status, DeliveryStatus::Failed);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.pool.lease_count(), 0);
    }

    #[tokio::test]
    async fn mail_from_421_registers_the_pairing_and_defers() {
        let h = harness(
            &[MX_HOST],
            vec![PoolScript::Transaction(vec![
                Step::Accept,
                Step::Reject("421 too many connections"),
            ])],
        );
        let msg = dispatch(&h, message()).await;

        // aborted before RCPT TO
        k9::assert_equal!(h.pool.steps(), vec!["helo", "mail_from"]);
        assert!(h.registry.is_unavailable(SOURCE, MX_HOST));
        assert_eq!(h.pool.given_back_count(), 0);

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, DeliveryStatus::Deferred);
        assert_eq!(
            updates[0].reason.as_deref(),
            Some("421 too many connections")
        );
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn rcpt_550_is_a_permanent_failure_with_the_verbatim_text() {
        let h = harness(
            &[MX_HOST],
            vec![PoolScript::Transaction(vec![
                Step::Accept,
                Step::Accept,
                Step::Reject("550 no such user"),
            ])],
        );
        let msg = dispatch(&h, message()).await;

        k9::assert_equal!(h.pool.steps(), vec!["helo", "mail_from", "rcpt_to"]);
        assert_eq!(h.pool.given_back_count(), 0);
        assert!(h.registry.is_empty());

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates[0].status, DeliveryStatus::Failed);
        assert_eq!(updates[0].reason.as_deref(), Some("550 no such user"));

        let events = h.events.all();
        assert_eq!(events[0].kind, EventKind::Bounce);
        assert_eq!(events[0].reason.as_deref(), Some("550 no such user"));
    }

    #[tokio::test]
    async fn other_4xx_replies_defer_with_the_verbatim_text() {
        let h = harness(
            &[MX_HOST],
            vec![PoolScript::Transaction(vec![
                Step::Accept,
                Step::Accept,
                Step::Accept,
                Step::Reject("452 mailbox full"),
            ])],
        );
        let msg = dispatch(&h, message()).await;

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates[0].status, DeliveryStatus::Deferred);
        assert_eq!(updates[0].reason.as_deref(), Some("452 mailbox full"));
        assert!(h.registry.is_empty());
        assert_eq!(h.pool.given_back_count(), 0);
    }

    #[tokio::test]
    async fn queue_timeout_fails_before_any_dns_lookup() {
        let h = harness(&[MX_HOST], vec![PoolScript::Transaction(vec![])]);
        let mut msg = message();
        // an hour of budget, exceeded by one minute, and due now
        msg.queued_at = Utc::now() - chrono::Duration::minutes(61);
        msg.attempt_send_after = Utc::now() - chrono::Duration::seconds(1);
        let msg = dispatch(&h, msg).await;

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, DeliveryStatus::TimedOut);
        assert_eq!(
            updates[0].reason.as_deref(),
            Some(recorder::TIMED_OUT_IN_QUEUE)
        );
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.pool.lease_count(), 0);
        assert_eq!(h.events.all()[0].kind, EventKind::TimedOutInQueue);
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn deferred_messages_go_back_without_side_effects() {
        let h = harness(&[MX_HOST], vec![PoolScript::Transaction(vec![])]);
        let mut msg = message();
        msg.attempt_send_after = Utc::now() + chrono::Duration::minutes(30);
        dispatch(&h, msg).await;

        assert_eq!(h.status.total_updates(), 0);
        assert_eq!(h.pool.lease_count(), 0);
        assert!(h.events.all().is_empty());
        // re-enqueued, not acked away
        assert_eq!(h.broker.pending(), 1);
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_max_connections_is_silent_and_leaves_the_lease() {
        let h = harness(&[MX_HOST], vec![PoolScript::FailedMaxConnections]);
        let msg = dispatch(&h, message()).await;

        assert_eq!(h.status.total_updates(), 0);
        assert!(h.events.all().is_empty());
        // no ack: the broker still owns the redelivery
        assert_eq!(h.broker.in_flight(), 1);
        drop(msg);
    }

    #[tokio::test]
    async fn pool_refusals_defer_and_ack() {
        for (script, reason) in [
            (PoolScript::FailedToConnect, recorder::FAILED_TO_CONNECT),
            (PoolScript::Throttled, recorder::THROTTLED),
            (PoolScript::ServiceUnavailable, recorder::SERVICE_UNAVAILABLE),
        ] {
            let h = harness(&[MX_HOST], vec![script]);
            let msg = dispatch(&h, message()).await;

            let updates = h.status.updates_for(msg.id);
            assert_eq!(updates.len(), 1, "{reason}");
            assert_eq!(updates[0].status, DeliveryStatus::Deferred, "{reason}");
            assert_eq!(updates[0].reason.as_deref(), Some(reason));
            assert_eq!(h.broker.in_flight(), 0, "{reason}");
        }
    }

    #[tokio::test]
    async fn repeated_transient_replies_each_record_a_deferral() {
        let reject = vec![Step::Accept, Step::Reject("451 try later")];
        let h = harness(
            &[MX_HOST],
            vec![
                PoolScript::Transaction(reject.clone()),
                PoolScript::Transaction(reject),
            ],
        );

        // the broker redelivers the same message after each deferral
        let msg = message();
        dispatch(&h, msg.clone()).await;
        dispatch(&h, msg.clone()).await;

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates.len(), 2);
        assert!(updates
            .iter()
            .all(|update| update.status == DeliveryStatus::Deferred
                && update.reason.as_deref() == Some("451 try later")));
    }

    #[tokio::test]
    async fn abrupt_connection_loss_defers_and_discards() {
        let h = harness(
            &[MX_HOST],
            vec![PoolScript::Transaction(vec![Step::Accept, Step::Abrupt])],
        );
        let msg = dispatch(&h, message()).await;

        let updates = h.status.updates_for(msg.id);
        assert_eq!(updates[0].status, DeliveryStatus::Deferred);
        assert_eq!(updates[0].reason.as_deref(), Some(recorder::ENDED_ABRUPTLY));
        assert_eq!(h.pool.given_back_count(), 0);
        assert_eq!(h.broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn start_drains_the_broker_and_stop_is_cooperative() {
        LifeCycle::init_for_tests();
        let h = harness(&[MX_HOST], vec![PoolScript::Transaction(vec![])]);
        let msg = message();
        let id = msg.id;
        h.broker.submit(msg);

        h.sender.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while h.status.updates_for(id).is_empty() {
            assert!(std::time::Instant::now() < deadline, "message never settled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.sender.stop().await;

        assert_eq!(h.status.updates_for(id).len(), 1);
        assert_eq!(h.broker.pending(), 0);
    }
}
