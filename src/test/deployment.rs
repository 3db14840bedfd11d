use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    bson::{doc, oid::ObjectId, Bson, Document, RawDocumentBuf, Timestamp},
    cmap::{
        conn::wire::{
            Message,
            MessageFlags,
            Reply,
            Request,
            Response,
            ResponseFlags,
            UpdateFlags,
        },
        Connection,
        ConnectionDescription,
    },
    test::{connect, Reaction},
    Namespace,
};

/// Overrides the deployment's answer to the next request.
pub(crate) enum Script {
    /// Answers a command with this document instead of running it.
    Fail(Document),

    /// Answers with an OP_REPLY carrying these flags and documents.
    Reply(ResponseFlags, Vec<Document>),

    /// Drops the connection instead of answering.
    Hangup,
}

/// An in-memory deployment answering insert, update, delete, find, getMore, killCursors,
/// getlasterror and dropUser in both the command and the legacy dialect.
#[derive(Clone, Default)]
pub(crate) struct FakeDeployment {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    collections: HashMap<Namespace, Vec<Document>>,
    cursors: HashMap<i64, (Namespace, VecDeque<Document>)>,
    next_cursor_id: i64,
    clock: u32,
    requests: Vec<&'static str>,
    commands: Vec<Document>,
    scripts: VecDeque<Script>,
}

impl FakeDeployment {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Opens a connection to the deployment. Each connection has its own last error, as
    /// `getlasterror` reports on the connection it is sent over.
    pub(crate) fn connect(&self, description: ConnectionDescription) -> Connection {
        let deployment = self.clone();
        let mut last_error = doc! { "n": 0 };
        connect(description, move |request| {
            deployment.handle(request, &mut last_error)
        })
    }

    pub(crate) fn seed(&self, namespace: &Namespace, documents: Vec<Document>) {
        self.lock()
            .collections
            .entry(namespace.clone())
            .or_default()
            .extend(documents);
    }

    pub(crate) fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.lock()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// The op names of every request received, in order.
    pub(crate) fn requests(&self) -> Vec<&'static str> {
        self.lock().requests.clone()
    }

    /// Every command document received, as sent.
    pub(crate) fn commands(&self) -> Vec<Document> {
        self.lock().commands.clone()
    }

    pub(crate) fn script(&self, script: Script) {
        self.lock().scripts.push_back(script);
    }

    pub(crate) fn open_cursors(&self) -> usize {
        self.lock().cursors.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn handle(&self, request: Request, last_error: &mut Document) -> Reaction {
        let mut state = self.lock();
        state.requests.push(request.op_name());

        if let Some(script) = state.scripts.pop_front() {
            return match script {
                Script::Hangup => Reaction::Hangup,
                Script::Reply(flags, documents) => {
                    Reaction::Respond(op_reply(flags, 0, documents))
                }
                Script::Fail(reply) => match request {
                    Request::Message(message) => {
                        state.commands.push(message.get_command_document());
                        Reaction::Respond(op_msg(reply))
                    }
                    Request::Query(_) | Request::GetMore(_) => {
                        Reaction::Respond(op_reply(ResponseFlags::empty(), 0, vec![reply]))
                    }
                    _ => Reaction::Silent,
                },
            };
        }

        match request {
            Request::Message(message) => {
                let command = message.get_command_document();
                state.commands.push(command.clone());
                let db = command.get_str("$db").unwrap_or("admin").to_string();
                let reply = state.run_command(&db, command, last_error);
                if message.flags.contains(MessageFlags::MORE_TO_COME) {
                    Reaction::Silent
                } else {
                    Reaction::Respond(op_msg(reply))
                }
            }
            Request::Query(query) => {
                let mut document = query.query.to_document().unwrap();
                if query.namespace.is_command() {
                    state.commands.push(document.clone());
                }
                if let Some(Bson::Document(inner)) = document.remove("$query") {
                    document = inner;
                }

                if query.namespace.is_command() {
                    let reply = state.run_command(&query.namespace.db, document, last_error);
                    return Reaction::Respond(op_reply(ResponseFlags::empty(), 0, vec![reply]));
                }

                let documents = state.find(&query.namespace, &document);
                let documents = documents
                    .into_iter()
                    .skip(query.number_to_skip as usize)
                    .collect();
                let number_to_return = query.number_to_return;
                let single_batch = number_to_return < 0 || number_to_return == 1;
                let (cursor_id, batch) = state.open_cursor(
                    query.namespace,
                    documents,
                    number_to_return.unsigned_abs() as usize,
                    single_batch,
                );
                Reaction::Respond(op_reply(ResponseFlags::empty(), cursor_id, batch))
            }
            Request::GetMore(get_more) => {
                let batch_size = get_more.number_to_return.unsigned_abs() as usize;
                match state.next_batch(get_more.cursor_id, batch_size) {
                    Some((_, cursor_id, batch)) => {
                        Reaction::Respond(op_reply(ResponseFlags::empty(), cursor_id, batch))
                    }
                    None => {
                        Reaction::Respond(op_reply(ResponseFlags::CURSOR_NOT_FOUND, 0, vec![]))
                    }
                }
            }
            Request::KillCursors(kill_cursors) => {
                for cursor_id in kill_cursors.cursor_ids {
                    state.cursors.remove(&cursor_id);
                }
                Reaction::Silent
            }
            Request::Insert(insert) => {
                for document in insert.documents {
                    let document = document.to_document().unwrap();
                    *last_error = match state.insert(&insert.namespace, document) {
                        Ok(()) => doc! { "n": 0 },
                        Err(error) => {
                            let mut last_error = doc! { "n": 0 };
                            last_error.insert("err", error.get_str("errmsg").unwrap());
                            last_error.insert("code", error.get_i32("code").unwrap());
                            last_error
                        }
                    };
                }
                Reaction::Silent
            }
            Request::Update(update) => {
                let (matched, upserted) = state.update(
                    &update.namespace,
                    &update.selector.to_document().unwrap(),
                    &update.update.to_document().unwrap(),
                    update.flags.contains(UpdateFlags::UPSERT),
                    update.flags.contains(UpdateFlags::MULTI_UPDATE),
                );
                let n = if upserted.is_some() { 1 } else { matched };
                *last_error = doc! { "n": n, "updatedExisting": matched > 0 };
                if let Some(id) = upserted {
                    last_error.insert("upserted", id);
                }
                Reaction::Silent
            }
            Request::Delete(delete) => {
                let removed = state.delete(
                    &delete.namespace,
                    &delete.selector.to_document().unwrap(),
                    !delete.single_remove,
                );
                *last_error = doc! { "n": removed };
                Reaction::Silent
            }
        }
    }
}

impl State {
    fn run_command(&mut self, db: &str, command: Document, last_error: &Document) -> Document {
        let name = command.keys().next().cloned().unwrap_or_default();
        let namespace = Namespace::new(db, command.get_str(&name).unwrap_or_default());

        let mut reply = match name.as_str() {
            "insert" => self.insert_command(&namespace, &command),
            "update" => self.update_command(&namespace, &command),
            "delete" => self.delete_command(&namespace, &command),
            "find" => self.find_command(&namespace, &command),
            "getMore" => self.get_more_command(&command),
            "killCursors" => {
                let cursors: Vec<Bson> = command
                    .get_array("cursors")
                    .cloned()
                    .unwrap_or_default();
                for cursor in &cursors {
                    if let Some(id) = cursor.as_i64() {
                        self.cursors.remove(&id);
                    }
                }
                doc! { "cursorsKilled": cursors }
            }
            "getlasterror" => last_error.clone(),
            "dropUser" => {
                let user = command.get_str("dropUser").unwrap_or_default().to_string();
                let users = Namespace::new(db, "system.users");
                if self.delete(&users, &doc! { "user": user.as_str() }, false) == 0 {
                    doc! {
                        "ok": 0,
                        "code": 11,
                        "codeName": "UserNotFound",
                        "errmsg": format!("User '{}@{}' not found", user, db),
                    }
                } else {
                    doc! {}
                }
            }
            _ => doc! {},
        };

        if !reply.contains_key("ok") {
            reply.insert("ok", 1);
        }
        self.clock += 1;
        let time = Timestamp {
            time: 1,
            increment: self.clock,
        };
        reply.insert("operationTime", time);
        reply.insert(
            "$clusterTime",
            doc! { "clusterTime": time, "signature": {} },
        );
        reply
    }

    fn insert_command(&mut self, namespace: &Namespace, command: &Document) -> Document {
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, document) in command
            .get_array("documents")
            .into_iter()
            .flatten()
            .enumerate()
        {
            let Bson::Document(document) = document else {
                continue;
            };
            match self.insert(namespace, document.clone()) {
                Ok(()) => n += 1,
                Err(mut error) => {
                    error.insert("index", index as i32);
                    write_errors.push(error);
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut reply = doc! { "n": n };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        reply
    }

    fn update_command(&mut self, namespace: &Namespace, command: &Document) -> Document {
        let mut n = 0;
        let mut modified = 0;
        let mut upserted = Vec::new();
        for (index, statement) in command
            .get_array("updates")
            .into_iter()
            .flatten()
            .enumerate()
        {
            let Bson::Document(statement) = statement else {
                continue;
            };
            let (matched, upserted_id) = self.update(
                namespace,
                statement.get_document("q").unwrap(),
                statement.get_document("u").unwrap(),
                statement.get_bool("upsert").unwrap_or(false),
                statement.get_bool("multi").unwrap_or(false),
            );
            n += matched;
            modified += matched;
            if let Some(id) = upserted_id {
                n += 1;
                upserted.push(doc! { "index": index as i32, "_id": id });
            }
        }

        let mut reply = doc! { "n": n, "nModified": modified };
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        reply
    }

    fn delete_command(&mut self, namespace: &Namespace, command: &Document) -> Document {
        let mut n = 0;
        for statement in command.get_array("deletes").into_iter().flatten() {
            let Bson::Document(statement) = statement else {
                continue;
            };
            n += self.delete(
                namespace,
                statement.get_document("q").unwrap(),
                statement.get_i32("limit").unwrap_or(0) == 0,
            );
        }
        doc! { "n": n }
    }

    fn find_command(&mut self, namespace: &Namespace, command: &Document) -> Document {
        let filter = command.get_document("filter").cloned().unwrap_or_default();
        let limit = command.get_i32("limit").unwrap_or(0).max(0) as usize;
        let batch_size = command.get_i32("batchSize").unwrap_or(0).max(0) as usize;
        let skip = command.get_i32("skip").unwrap_or(0).max(0) as usize;

        let mut documents: Vec<Document> = self
            .find(namespace, &filter)
            .into_iter()
            .skip(skip)
            .collect();
        if limit > 0 {
            documents.truncate(limit);
        }
        let batch_size = if batch_size > 0 { batch_size } else { limit };
        let single_batch = command.get_bool("singleBatch").unwrap_or(false);
        let (cursor_id, batch) =
            self.open_cursor(namespace.clone(), documents, batch_size, single_batch);

        doc! {
            "cursor": {
                "firstBatch": batch,
                "id": cursor_id,
                "ns": namespace.to_string(),
            }
        }
    }

    fn get_more_command(&mut self, command: &Document) -> Document {
        let cursor_id = command.get_i64("getMore").unwrap_or_default();
        let batch_size = command.get_i32("batchSize").unwrap_or(0).max(0) as usize;
        match self.next_batch(cursor_id, batch_size) {
            Some((namespace, cursor_id, batch)) => doc! {
                "cursor": {
                    "nextBatch": batch,
                    "id": cursor_id,
                    "ns": namespace.to_string(),
                }
            },
            None => doc! {
                "ok": 0,
                "code": 43,
                "codeName": "CursorNotFound",
                "errmsg": format!("cursor id {} not found", cursor_id),
            },
        }
    }

    fn insert(&mut self, namespace: &Namespace, mut document: Document) -> Result<(), Document> {
        let collection = self.collections.entry(namespace.clone()).or_default();
        if !document.contains_key("_id") {
            document.insert("_id", ObjectId::new());
        }
        if collection
            .iter()
            .any(|existing| existing.get("_id") == document.get("_id"))
        {
            return Err(doc! {
                "code": 11000,
                "errmsg": "E11000 duplicate key error",
            });
        }
        collection.push(document);
        Ok(())
    }

    fn find(&self, namespace: &Namespace, filter: &Document) -> Vec<Document> {
        self.collections
            .get(namespace)
            .map(|collection| {
                collection
                    .iter()
                    .filter(|document| matches(document, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of documents matched, and the `_id` of the document an upsert
    /// inserted.
    fn update(
        &mut self,
        namespace: &Namespace,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> (i32, Option<Bson>) {
        let collection = self.collections.entry(namespace.clone()).or_default();
        let mut matched = 0;
        for document in collection.iter_mut() {
            if !matches(document, filter) {
                continue;
            }
            apply_update(document, update);
            matched += 1;
            if !multi {
                break;
            }
        }

        if matched == 0 && upsert {
            let mut document: Document = filter
                .iter()
                .filter(|(key, _)| !key.starts_with('$'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            apply_update(&mut document, update);
            if !document.contains_key("_id") {
                document.insert("_id", ObjectId::new());
            }
            let id = document.get("_id").cloned();
            collection.push(document);
            return (0, id);
        }
        (matched, None)
    }

    fn delete(&mut self, namespace: &Namespace, filter: &Document, multi: bool) -> i32 {
        let Some(collection) = self.collections.get_mut(namespace) else {
            return 0;
        };
        let mut removed = 0;
        collection.retain(|document| {
            if (multi || removed == 0) && matches(document, filter) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    fn open_cursor(
        &mut self,
        namespace: Namespace,
        documents: Vec<Document>,
        batch_size: usize,
        single_batch: bool,
    ) -> (i64, Vec<Document>) {
        let mut remaining: VecDeque<Document> = documents.into();
        let take = if batch_size == 0 {
            remaining.len()
        } else {
            batch_size.min(remaining.len())
        };
        let batch = remaining.drain(..take).collect();
        if remaining.is_empty() || single_batch {
            return (0, batch);
        }

        self.next_cursor_id += 1;
        let cursor_id = 1000 + self.next_cursor_id;
        self.cursors.insert(cursor_id, (namespace, remaining));
        (cursor_id, batch)
    }

    fn next_batch(
        &mut self,
        cursor_id: i64,
        batch_size: usize,
    ) -> Option<(Namespace, i64, Vec<Document>)> {
        let (namespace, remaining) = self.cursors.get_mut(&cursor_id)?;
        let take = if batch_size == 0 {
            remaining.len()
        } else {
            batch_size.min(remaining.len())
        };
        let batch: Vec<Document> = remaining.drain(..take).collect();
        let namespace = namespace.clone();
        let exhausted = remaining.is_empty();

        if exhausted {
            self.cursors.remove(&cursor_id);
            return Some((namespace, 0, batch));
        }
        Some((namespace, cursor_id, batch))
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, value)| document.get(key) == Some(value))
}

fn apply_update(document: &mut Document, update: &Document) {
    let uses_operators = update
        .keys()
        .next()
        .map(|key| key.starts_with('$'))
        .unwrap_or(false);
    if !uses_operators {
        let id = document.get("_id").cloned();
        *document = update.clone();
        if let Some(id) = id {
            document.insert("_id", id);
        }
        return;
    }

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            continue;
        };
        for (field, value) in fields {
            match operator.as_str() {
                "$set" => {
                    document.insert(field, value.clone());
                }
                "$unset" => {
                    document.remove(field);
                }
                "$inc" => {
                    let current = document.get_i32(field).unwrap_or(0);
                    document.insert(field, current + value.as_i32().unwrap_or(0));
                }
                _ => {}
            }
        }
    }
}

fn raw(document: Document) -> RawDocumentBuf {
    RawDocumentBuf::from_document(&document).unwrap()
}

fn op_msg(reply: Document) -> Response {
    Response::Message(Message::new(raw(reply), MessageFlags::empty()))
}

fn op_reply(flags: ResponseFlags, cursor_id: i64, documents: Vec<Document>) -> Response {
    let documents: Vec<RawDocumentBuf> = documents.into_iter().map(raw).collect();
    Response::Reply(Reply {
        flags,
        cursor_id,
        starting_from: 0,
        number_returned: documents.len() as i32,
        documents,
    })
}
