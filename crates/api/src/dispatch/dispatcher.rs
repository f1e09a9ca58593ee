use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dispatch_core::archive::JobArchive;
use dispatch_core::channels::{
    area_channel, authorize_subscribe, job_channel, location_channel, normalize_scope,
    service_channel, ChannelKind, CHANNEL_ADMIN, CHANNEL_CLIENTS, CHANNEL_CONTRACTORS,
};
use dispatch_core::error::CoreError;
use dispatch_core::jobs::{Job, JobKind, NewJob, Priority};
use dispatch_core::protocol::{
    ChannelPayload, ChatPayload, ClientMessage, ConnectionMetadata, Contact, EmergencyPayload,
    JobAcceptPayload, JobCompletePayload, LocationUpdatePayload, RegisterPayload, ServerMessage,
};
use dispatch_core::roles::Role;
use dispatch_events::ChannelHub;
use dispatch_queue::JobQueue;
use dispatch_store::StateStore;
use serde_json::json;

use crate::config::DispatchConfig;
use crate::dispatch::offers::offer_ready;
use crate::dispatch::session::Session;
use crate::metrics::Metrics;

const ESTIMATED_RESPONSE: &str = "15-30 minutes";
const DEFAULT_ARRIVAL: &str = "30 minutes";

/// Result of handling one inbound frame.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    /// Direct replies to the sender, in order.
    pub replies: Vec<ServerMessage>,
    /// Close the transport after sending the replies.
    pub disconnect: bool,
}

impl Outcome {
    fn reply(message: ServerMessage) -> Self {
        Self {
            replies: vec![message],
            disconnect: false,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

type Handled = Result<Option<ServerMessage>, CoreError>;

pub struct Dispatcher {
    hub: Arc<ChannelHub>,
    queue: Arc<JobQueue>,
    store: Arc<dyn StateStore>,
    archive: Arc<dyn JobArchive>,
    metrics: Arc<Metrics>,
    config: DispatchConfig,
    server_name: String,
}

impl Dispatcher {
    pub fn new(
        hub: Arc<ChannelHub>,
        queue: Arc<JobQueue>,
        store: Arc<dyn StateStore>,
        archive: Arc<dyn JobArchive>,
        metrics: Arc<Metrics>,
        config: DispatchConfig,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            queue,
            store,
            archive,
            metrics,
            config,
            server_name: server_name.into(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Handshake acknowledgement sent as soon as the transport opens.
    pub fn greet(&self, session: &Session) -> ServerMessage {
        ServerMessage::Connected {
            connection_id: session.conn_id().to_string(),
            server: self.server_name.clone(),
        }
    }

    /// Decode, validate and handle one text frame.
    pub async fn handle_text(&self, session: &mut Session, text: &str) -> Outcome {
        let started = Instant::now();

        let outcome = match ClientMessage::parse(text) {
            Err(err) => {
                tracing::debug!(conn_id = session.conn_id(), error = %err, "Malformed message");
                self.malformed(session, ServerMessage::error(&err))
            }
            Ok(message) if !session.is_registered() && !is_register(&message) => {
                let reply = ServerMessage::error_with_code(
                    "NOT_REGISTERED",
                    format!("Register before sending '{}'", message.kind()),
                );
                self.malformed(session, reply)
            }
            Ok(message) => {
                session.malformed_streak = 0;
                if session.is_registered() {
                    self.hub.registry().touch(session.conn_id()).await;
                }
                self.handle(session, message).await
            }
        };

        let is_error = outcome
            .replies
            .iter()
            .any(|r| matches!(r, ServerMessage::Error { .. }));
        self.metrics.record_message(started.elapsed(), is_error);
        outcome
    }

    /// Handle a decoded message. The caller enforces registration.
    pub async fn handle(&self, session: &mut Session, message: ClientMessage) -> Outcome {
        let kind = message.kind();
        let result = match message {
            ClientMessage::Register(payload) => self.register(session, payload).await,
            ClientMessage::Subscribe(payload) => self.subscribe(session, payload).await,
            ClientMessage::Unsubscribe(payload) => self.unsubscribe(session, payload).await,
            ClientMessage::Emergency(payload) => self.emergency(session, payload).await,
            ClientMessage::JobAccept(payload) => self.job_accept(session, payload).await,
            ClientMessage::JobComplete(payload) => self.job_complete(session, payload).await,
            ClientMessage::LocationUpdate(payload) => self.location_update(session, payload).await,
            ClientMessage::Chat(payload) => self.chat(session, payload).await,
            ClientMessage::Ping => self.ping(session).await,
        };

        match result {
            Ok(Some(reply)) => Outcome::reply(reply),
            Ok(None) => Outcome::none(),
            Err(err) => {
                if err.is_dependency_failure() {
                    self.metrics.record_dependency_failure();
                    tracing::error!(conn_id = session.conn_id(), kind, error = %err, "Message failed");
                } else {
                    tracing::debug!(conn_id = session.conn_id(), kind, error = %err, "Message rejected");
                }
                Outcome::reply(ServerMessage::error(&err))
            }
        }
    }

    /// A transport-level pong counts as activity for a registered session.
    pub async fn transport_pong(&self, session: &Session) {
        if session.is_registered() {
            self.hub.registry().touch(session.conn_id()).await;
        }
    }

    /// Tear down a closed transport: registry entry and every membership.
    /// Accepted jobs stay active until their heartbeat lapses.
    pub async fn close(&self, session: &Session) {
        if self.hub.disconnect(session.conn_id()).await && !session.active_jobs.is_empty() {
            tracing::info!(
                conn_id = session.conn_id(),
                active_jobs = session.active_jobs.len(),
                "Contractor left with active jobs"
            );
        }
    }

    fn malformed(&self, session: &mut Session, reply: ServerMessage) -> Outcome {
        session.malformed_streak += 1;
        let disconnect = session.malformed_streak >= self.config.max_malformed;
        if disconnect {
            tracing::warn!(
                conn_id = session.conn_id(),
                streak = session.malformed_streak,
                "Too many malformed messages, disconnecting"
            );
        }
        Outcome {
            replies: vec![reply],
            disconnect,
        }
    }

    // -----------------------------------------------------------------------
    // Registration and channels
    // -----------------------------------------------------------------------

    async fn register(&self, session: &mut Session, payload: RegisterPayload) -> Handled {
        if session.is_registered() {
            return Err(CoreError::Conflict(
                "Connection is already registered".into(),
            ));
        }
        let RegisterPayload { role, metadata } = payload;
        let wanted = auto_channels(role, &metadata);

        self.hub
            .registry()
            .add(
                session.conn_id().to_string(),
                role,
                metadata,
                session.sender().clone(),
            )
            .await?;
        session.role = Some(role);

        let mut channels = Vec::with_capacity(wanted.len());
        for channel in wanted {
            if let Err(e) = ChannelKind::parse(&channel) {
                tracing::warn!(conn_id = session.conn_id(), channel = %channel, error = %e, "Skipping auto-subscription");
                continue;
            }
            self.hub.subscribe(session.conn_id(), &channel).await?;
            channels.push(channel);
        }

        tracing::info!(conn_id = session.conn_id(), role = %role, channels = channels.len(), "Registered");
        Ok(Some(ServerMessage::Registered {
            connection_id: session.conn_id().to_string(),
            role,
            channels,
        }))
    }

    async fn subscribe(&self, session: &Session, payload: ChannelPayload) -> Handled {
        let role = registered_role(session)?;
        let channel = authorize_subscribe(role, &payload.channel)?.name();
        self.hub.subscribe(session.conn_id(), &channel).await?;
        Ok(Some(ServerMessage::Subscribed { channel }))
    }

    async fn unsubscribe(&self, session: &Session, payload: ChannelPayload) -> Handled {
        registered_role(session)?;
        // Names that do not parse were never joined; removing them is a no-op.
        let channel = ChannelKind::parse(&payload.channel)
            .map(|kind| kind.name())
            .unwrap_or(payload.channel);
        self.hub.unsubscribe(session.conn_id(), &channel).await?;
        Ok(Some(ServerMessage::Unsubscribed { channel }))
    }

    // -----------------------------------------------------------------------
    // Emergencies
    // -----------------------------------------------------------------------

    async fn emergency(&self, session: &Session, payload: EmergencyPayload) -> Handled {
        let metadata = match self.metadata_of(session).await {
            Ok(metadata) => metadata,
            Err(err) => return Ok(Some(self.emergency_failed(session, err))),
        };

        let reporter_key = metadata
            .session_id
            .clone()
            .unwrap_or_else(|| session.conn_id().to_string());
        match self.within_rate_limit(&reporter_key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(conn_id = session.conn_id(), reporter = %reporter_key, "Emergency rate limit hit");
                return Ok(Some(ServerMessage::error_with_code(
                    "RATE_LIMITED",
                    format!(
                        "At most {} emergencies per {}s",
                        self.config.emergency_rate_limit,
                        self.config.emergency_rate_window.as_secs()
                    ),
                )));
            }
            Err(err) => return Ok(Some(self.emergency_failed(session, err))),
        }

        match self.raise_emergency(session, &metadata, payload).await {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => Ok(Some(self.emergency_failed(session, err))),
        }
    }

    async fn within_rate_limit(&self, reporter: &str) -> Result<bool, CoreError> {
        let count = self
            .store
            .increment(
                &format!("ratelimit:emergency:{reporter}"),
                self.config.emergency_rate_window,
            )
            .await?;
        Ok(count <= self.config.emergency_rate_limit)
    }

    async fn raise_emergency(
        &self,
        session: &Session,
        metadata: &ConnectionMetadata,
        payload: EmergencyPayload,
    ) -> Result<ServerMessage, CoreError> {
        let location = payload
            .location
            .clone()
            .or_else(|| payload.area.clone())
            .or_else(|| metadata.location.clone())
            .or_else(|| metadata.area.clone())
            .ok_or_else(|| CoreError::Validation("Emergency location is required".into()))?;
        let area = normalize_scope(
            payload
                .area
                .as_deref()
                .or(metadata.area.as_deref())
                .unwrap_or(&location),
        );
        let contact = resolve_contact(payload.contact, metadata);

        let input = NewJob {
            kind: JobKind::Emergency,
            area: area.clone(),
            payload: json!({
                "emergencyType": payload.emergency_type,
                "location": location,
                "area": area,
                "description": payload.description,
                "contact": contact,
                "reporterConnection": session.conn_id(),
            }),
            reporter: Some(session.conn_id().to_string()),
            not_before: None,
        };
        let job = self.queue.enqueue(input, Priority::Emergency).await?;
        self.metrics.record_emergency();

        self.hub
            .subscribe(session.conn_id(), &job_channel(job.id))
            .await?;
        let offered = offer_ready(&self.queue, &self.hub, Priority::Emergency).await;

        self.hub
            .broadcast(
                CHANNEL_ADMIN,
                &ServerMessage::JobStatusUpdate {
                    job_id: job.id,
                    status: job.status,
                    contractor_id: None,
                    notes: Some(format!(
                        "{} emergency reported at {location}",
                        payload.emergency_type
                    )),
                },
            )
            .await;

        tracing::info!(
            job_id = %job.id,
            conn_id = session.conn_id(),
            area = %job.area,
            offered,
            "Emergency received"
        );
        Ok(ServerMessage::EmergencyReceived {
            job_id: job.id,
            status: job.status,
            message: "Emergency received, notifying nearby contractors".into(),
            estimated_response: ESTIMATED_RESPONSE.into(),
        })
    }

    fn emergency_failed(&self, session: &Session, err: CoreError) -> ServerMessage {
        if err.is_dependency_failure() {
            self.metrics.record_dependency_failure();
            tracing::error!(conn_id = session.conn_id(), error = %err, "Emergency failed");
        } else {
            tracing::info!(conn_id = session.conn_id(), error = %err, "Emergency rejected");
        }
        ServerMessage::error_with_code("EMERGENCY_FAILED", err.to_string())
    }

    // -----------------------------------------------------------------------
    // Job lifecycle
    // -----------------------------------------------------------------------

    async fn job_accept(&self, session: &mut Session, payload: JobAcceptPayload) -> Handled {
        require_role(session, Role::Contractor)?;
        let metadata = self.metadata_of(session).await?;
        let contractor_id = contractor_identity(session, &metadata);
        let job_id = payload.job_id;

        let job = match self.queue.claim(job_id, &contractor_id).await {
            Ok(job) => job,
            Err(CoreError::LockContention(_)) => {
                return Ok(Some(ServerMessage::JobRejected {
                    job_id,
                    reason: "Job is being accepted by another contractor".into(),
                }))
            }
            Err(CoreError::Conflict(_)) => {
                return Ok(Some(ServerMessage::JobRejected {
                    job_id,
                    reason: "Job is no longer available".into(),
                }))
            }
            Err(err) => return Err(err),
        };
        self.metrics.record_accepted();
        session.active_jobs.insert(job_id);

        let channel = job_channel(job_id);
        self.hub.subscribe(session.conn_id(), &channel).await?;

        let assigned = ServerMessage::ContractorAssigned {
            job_id,
            contractor_id: contractor_id.clone(),
            business_name: metadata.business_name.clone(),
            estimated_arrival: payload
                .estimated_arrival
                .unwrap_or_else(|| DEFAULT_ARRIVAL.to_string()),
            phone: payload.contact_phone.or_else(|| metadata.phone.clone()),
        };
        let notified = self
            .hub
            .broadcast_except(&channel, &assigned, session.conn_id())
            .await;
        self.hub
            .broadcast_except(
                &area_channel(&job.area),
                &ServerMessage::JobTaken { job_id },
                session.conn_id(),
            )
            .await;
        self.hub
            .broadcast(CHANNEL_ADMIN, &status_update(&job, None))
            .await;

        tracing::info!(job_id = %job_id, contractor_id = %contractor_id, notified, "Job accepted");
        Ok(Some(ServerMessage::JobAccepted {
            job_id,
            details: serde_json::to_value(&job)?,
        }))
    }

    async fn job_complete(&self, session: &mut Session, payload: JobCompletePayload) -> Handled {
        require_role(session, Role::Contractor)?;
        let metadata = self.metadata_of(session).await?;
        let contractor_id = contractor_identity(session, &metadata);

        let job = self
            .queue
            .mark_completed(payload.job_id, Some(&contractor_id))
            .await?;
        session.active_jobs.remove(&job.id);
        self.metrics.record_completed();
        self.archive_job(&job).await;

        let update = status_update(&job, payload.notes);
        self.hub
            .broadcast_except(&job_channel(job.id), &update, session.conn_id())
            .await;
        self.hub.broadcast(CHANNEL_ADMIN, &update).await;

        tracing::info!(
            job_id = %job.id,
            contractor_id = %contractor_id,
            invoice_amount = payload.invoice_amount,
            "Job completed"
        );
        Ok(Some(update))
    }

    /// Write a terminal job to the archive. Failures are left for the
    /// background archiver.
    async fn archive_job(&self, job: &Job) {
        match self.archive.persist(job).await {
            Ok(()) => {
                if let Err(e) = self.queue.mark_archived(job.id).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Archived flag not recorded");
                }
            }
            Err(e) => {
                self.metrics.record_dependency_failure();
                tracing::warn!(job_id = %job.id, error = %e, "Archive write failed, will retry");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Contractor presence, chat, ping
    // -----------------------------------------------------------------------

    async fn location_update(
        &self,
        session: &mut Session,
        payload: LocationUpdatePayload,
    ) -> Handled {
        require_role(session, Role::Contractor)?;
        let conn_id = session.conn_id().to_string();
        let previous_area = self.metadata_of(session).await?.area;

        let LocationUpdatePayload {
            location,
            area,
            lat,
            lng,
        } = payload;
        let metadata = self
            .hub
            .registry()
            .update_metadata(&conn_id, |m| {
                m.location = Some(location.clone());
                if let Some(area) = &area {
                    m.area = Some(area.clone());
                }
                if let Some(lat) = lat {
                    m.extra.insert("lat".into(), json!(lat));
                }
                if let Some(lng) = lng {
                    m.extra.insert("lng".into(), json!(lng));
                }
            })
            .await
            .ok_or_else(|| CoreError::connection_not_found(&conn_id))?;

        if let Some(new_area) = &area {
            let new_channel = area_channel(new_area);
            let old_channel = previous_area.as_deref().map(area_channel);
            if old_channel.as_deref() != Some(new_channel.as_str()) {
                if let Some(old_channel) = old_channel {
                    self.hub.unsubscribe(&conn_id, &old_channel).await?;
                }
                ChannelKind::parse(&new_channel)?;
                self.hub.subscribe(&conn_id, &new_channel).await?;
                tracing::debug!(conn_id = %conn_id, channel = %new_channel, "Area subscription moved");
            }
        }

        if let Some(current_area) = metadata.area.as_deref() {
            if self.hub.is_member(&conn_id, &area_channel(current_area)).await {
                let available = ServerMessage::ContractorAvailable {
                    contractor_id: contractor_identity(session, &metadata),
                    business_name: metadata.business_name.clone(),
                    location,
                    area: normalize_scope(current_area),
                };
                self.hub
                    .broadcast(&location_channel(current_area), &available)
                    .await;
            }
        }

        self.refresh_heartbeats(session).await;
        Ok(None)
    }

    async fn chat(&self, session: &Session, payload: ChatPayload) -> Handled {
        let channel = job_channel(payload.job_id);
        if !self.hub.is_member(session.conn_id(), &channel).await {
            return Err(CoreError::Forbidden(format!(
                "Not a participant of job {}",
                payload.job_id
            )));
        }
        let message_id = uuid::Uuid::new_v4().to_string();
        let message = ServerMessage::ChatMessage {
            message_id: message_id.clone(),
            job_id: payload.job_id,
            from: session.conn_id().to_string(),
            content: payload.content,
            sent_at: Utc::now(),
        };
        self.hub
            .broadcast_except(&channel, &message, session.conn_id())
            .await;
        Ok(Some(ServerMessage::MessageSent { message_id }))
    }

    async fn ping(&self, session: &mut Session) -> Handled {
        self.refresh_heartbeats(session).await;
        Ok(Some(ServerMessage::Pong))
    }

    /// Keep this connection's accepted jobs alive. Jobs that are no longer
    /// active are forgotten.
    async fn refresh_heartbeats(&self, session: &mut Session) {
        let jobs: Vec<_> = session.active_jobs.iter().copied().collect();
        for job_id in jobs {
            match self.queue.heartbeat(job_id).await {
                Ok(true) => {}
                Ok(false) => {
                    session.active_jobs.remove(&job_id);
                }
                Err(e) => {
                    self.metrics.record_dependency_failure();
                    tracing::warn!(job_id = %job_id, error = %e, "Heartbeat refresh failed");
                }
            }
        }
    }

    async fn metadata_of(&self, session: &Session) -> Result<ConnectionMetadata, CoreError> {
        self.hub
            .registry()
            .get(session.conn_id())
            .await
            .map(|snapshot| snapshot.metadata)
            .ok_or_else(|| CoreError::connection_not_found(session.conn_id()))
    }
}

fn is_register(message: &ClientMessage) -> bool {
    matches!(message, ClientMessage::Register(_))
}

fn registered_role(session: &Session) -> Result<Role, CoreError> {
    session
        .role()
        .ok_or_else(|| CoreError::Unauthorized("Connection is not registered".into()))
}

fn require_role(session: &Session, role: Role) -> Result<(), CoreError> {
    let actual = registered_role(session)?;
    if actual == role {
        Ok(())
    } else {
        Err(CoreError::Forbidden(format!(
            "Only {role} connections may do this, not {actual}"
        )))
    }
}

/// Directory id when the contractor registered with one, else the
/// connection id.
fn contractor_identity(session: &Session, metadata: &ConnectionMetadata) -> String {
    metadata
        .contractor_id
        .clone()
        .unwrap_or_else(|| session.conn_id().to_string())
}

/// Channels joined on registration.
fn auto_channels(role: Role, metadata: &ConnectionMetadata) -> Vec<String> {
    match role {
        Role::Client => {
            let mut channels = vec![CHANNEL_CLIENTS.to_string()];
            if let Some(location) = &metadata.location {
                channels.push(location_channel(location));
            }
            channels
        }
        Role::Contractor => {
            let mut channels = vec![CHANNEL_CONTRACTORS.to_string()];
            if let Some(area) = &metadata.area {
                channels.push(area_channel(area));
            }
            channels.extend(metadata.services.iter().map(|s| service_channel(s)));
            channels
        }
        Role::Admin => vec![CHANNEL_ADMIN.to_string()],
    }
}

/// Contact from the payload, falling back to what the reporter registered
/// with.
fn resolve_contact(given: Option<Contact>, metadata: &ConnectionMetadata) -> Contact {
    match given {
        Some(contact) if !contact.is_empty() => contact,
        _ => Contact {
            name: metadata.business_name.clone(),
            phone: metadata.phone.clone(),
            email: None,
        },
    }
}

fn status_update(job: &Job, notes: Option<String>) -> ServerMessage {
    ServerMessage::JobStatusUpdate {
        job_id: job.id,
        status: job.status,
        contractor_id: job.assigned_contractor.clone(),
        notes,
    }
}
