use std::sync::Arc;

use futures_util::FutureExt;

use super::{Endpoint, Protocol};
use crate::{
    bson::Document,
    cmap::{Command, CommandResponse, Connection, SplittablePayload},
    codec::Decoder,
    error::Result,
    options::ServerApi,
    selection_criteria::ReadPreference,
    session::{NoSessionContext, SessionContext},
    BoxFuture,
};

/// Runs one command, optionally carrying as much of a [`SplittablePayload`] as fits.
///
/// The output is `None` only when the command was sent without expecting a response.
pub struct CommandProtocol<D: Decoder> {
    endpoint: Endpoint,
    database: String,
    command: Document,
    decoder: D,
    read_preference: Option<ReadPreference>,
    session_context: Arc<dyn SessionContext>,
    server_api: Option<ServerApi>,
    payload: Option<SplittablePayload>,
    response_expected: bool,
}

impl<D: Decoder> std::fmt::Debug for CommandProtocol<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProtocol")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("command", &self.command)
            .field("read_preference", &self.read_preference)
            .field("response_expected", &self.response_expected)
            .finish()
    }
}

impl<D: Decoder> CommandProtocol<D> {
    /// Creates an executor running `command` against `database`. The first key of `command`
    /// names it.
    pub fn new(
        connection: Connection,
        database: impl Into<String>,
        command: Document,
        decoder: D,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(connection),
            database: database.into(),
            command,
            decoder,
            read_preference: None,
            session_context: Arc::new(NoSessionContext),
            server_api: None,
            payload: None,
            response_expected: true,
        }
    }

    /// The read preference of a read command. Writes leave it unset.
    pub fn read_preference(mut self, read_preference: Option<ReadPreference>) -> Self {
        self.read_preference = read_preference;
        self
    }

    /// The session the command runs under.
    pub fn session_context(mut self, session_context: Arc<dyn SessionContext>) -> Self {
        self.session_context = session_context;
        self
    }

    /// The declared API version stamped onto the command.
    pub fn server_api(mut self, server_api: Option<ServerApi>) -> Self {
        self.server_api = server_api;
        self
    }

    /// Whether to wait for a reply. Without one the message is sent with `moreToCome`.
    pub fn response_expected(mut self, response_expected: bool) -> Self {
        self.response_expected = response_expected;
        self
    }

    /// Attaches documents to send as a document sequence alongside the command.
    pub fn payload(mut self, payload: SplittablePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Takes back the payload, advanced past the documents that were sent.
    pub fn take_payload(&mut self) -> Option<SplittablePayload> {
        self.payload.take()
    }

    async fn run(&mut self) -> Result<Option<D::Output>> {
        self.session_context.ensure_usable()?;
        let connection = self.endpoint.connection();
        let description = connection.description();

        let mut command = Command::from_document(
            self.database.as_str(),
            self.command.clone(),
            self.read_preference.clone(),
        )?;
        command.set_session(self.session_context.as_ref());
        if let Some(ref server_api) = self.server_api {
            command.set_server_api(server_api);
        }
        command.response_expected = self.response_expected;

        let mut sent = 0;
        if let Some(ref payload) = self.payload {
            let sequence = payload.next_batch(&command.body, description)?;
            sent = sequence.documents.len();
            command.document_sequences.push(sequence);
        }

        let request = command.into_request(description)?;
        let response = connection
            .send_message(request, self.endpoint.context())
            .await?;
        if let Some(ref mut payload) = self.payload {
            payload.advance(sent);
        }

        let Some(response) = response else {
            return Ok(None);
        };
        let response = CommandResponse::new(connection.address().clone(), response)?;
        response.update_session(self.session_context.as_ref());
        response.validate()?;
        response.decode(&self.decoder).map(Some)
    }
}

impl<D: Decoder> Protocol for CommandProtocol<D> {
    type Output = Option<D::Output>;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    fn exchange(&mut self) -> BoxFuture<'_, Result<Self::Output>> {
        self.run().boxed()
    }
}
