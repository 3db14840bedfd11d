use pretty_assertions::assert_eq;

use super::{
    DocumentSequence,
    Header,
    Message,
    MessageFlags,
    OpCode,
    Query,
    QueryFlags,
    Reply,
    Request,
    Response,
    ResponseFlags,
};
use crate::{
    bson::{doc, rawdoc},
    Namespace,
};

const MAX_MESSAGE_SIZE: i32 = 48_000_000;

#[tokio::test]
async fn op_msg_with_document_sequence() {
    let mut message = Message::new(
        rawdoc! { "insert": "coll", "$db": "db" },
        MessageFlags::empty(),
    );
    message.document_sequences.push(DocumentSequence {
        identifier: "documents".to_string(),
        documents: vec![rawdoc! { "_id": 1 }, rawdoc! { "_id": 2 }],
    });

    let bytes = Request::Message(message).encode(7).unwrap();
    let (header, request) = Request::read_from(&mut bytes.as_slice(), MAX_MESSAGE_SIZE)
        .await
        .unwrap();

    assert_eq!(header.length as usize, bytes.len());
    assert_eq!(header.request_id, 7);
    assert_eq!(header.op_code, OpCode::Message);

    let Request::Message(message) = request else {
        panic!("expected OP_MSG");
    };
    assert_eq!(
        message.get_command_document(),
        doc! {
            "insert": "coll",
            "$db": "db",
            "documents": [{ "_id": 1 }, { "_id": 2 }],
        }
    );
}

#[tokio::test]
async fn op_query_round_trip_through_server_side_decoder() {
    let query = Query {
        flags: QueryFlags::SECONDARY_OK,
        namespace: Namespace::command("admin"),
        number_to_skip: 0,
        number_to_return: -1,
        query: rawdoc! { "ping": 1 },
        return_fields_selector: None,
    };
    let request = Request::Query(query);
    assert!(request.expects_response());

    let bytes = request.encode(1).unwrap();
    let (_, decoded) = Request::read_from(&mut bytes.as_slice(), MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    let Request::Query(decoded) = decoded else {
        panic!("expected OP_QUERY");
    };
    assert_eq!(decoded.flags, QueryFlags::SECONDARY_OK);
    assert_eq!(decoded.namespace.to_string(), "admin.$cmd");
    assert_eq!(decoded.number_to_return, -1);
    assert_eq!(decoded.query, rawdoc! { "ping": 1 });
    assert!(decoded.return_fields_selector.is_none());
}

#[tokio::test]
async fn op_reply_is_read_with_flags_and_cursor() {
    let reply = Response::Reply(Reply {
        flags: ResponseFlags::AWAIT_CAPABLE,
        cursor_id: 42,
        starting_from: 0,
        number_returned: 2,
        documents: vec![rawdoc! { "x": 1 }, rawdoc! { "x": 2 }],
    });
    let bytes = reply.encode(3, 9).unwrap();

    let (response_to, response) = Response::read_from(&mut bytes.as_slice(), MAX_MESSAGE_SIZE)
        .await
        .unwrap();
    assert_eq!(response_to, 9);
    let Response::Reply(reply) = response else {
        panic!("expected OP_REPLY");
    };
    assert_eq!(reply.cursor_id, 42);
    assert_eq!(reply.flags, ResponseFlags::AWAIT_CAPABLE);
    assert_eq!(reply.documents.len(), 2);
}

#[tokio::test]
async fn op_reply_with_wrong_document_count_is_rejected() {
    let reply = Response::Reply(Reply {
        flags: ResponseFlags::empty(),
        cursor_id: 0,
        starting_from: 0,
        number_returned: 3,
        documents: vec![rawdoc! { "x": 1 }],
    });
    let bytes = reply.encode(1, 1).unwrap();

    let error = Response::read_from(&mut bytes.as_slice(), MAX_MESSAGE_SIZE)
        .await
        .unwrap_err();
    assert!(
        matches!(*error.kind, crate::error::ErrorKind::InvalidResponse { .. }),
        "{:?}",
        error
    );
}

#[tokio::test]
async fn oversized_message_is_rejected_before_reading_body() {
    let bytes = Request::Message(Message::new(rawdoc! { "ping": 1 }, MessageFlags::empty()))
        .encode(1)
        .unwrap();
    let error = Response::read_from(&mut bytes.as_slice(), Header::LENGTH as i32)
        .await
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        crate::error::ErrorKind::InvalidResponse { .. }
    ));
}

#[test]
fn unacknowledged_op_msg_expects_no_response() {
    let request = Request::Message(Message::new(
        rawdoc! { "insert": "coll" },
        MessageFlags::MORE_TO_COME,
    ));
    assert!(!request.expects_response());
    assert_eq!(request.op_name(), "OP_MSG");
}
