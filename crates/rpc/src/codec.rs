//! Wire framing: each frame is a JSON document prefixed with a four-byte
//! little-endian length header.

use crate::RpcError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger is a protocol error.
pub const MAX_FRAME: usize = 1 << 26;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// `{id, method, params}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: ErrorPayload) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Write one frame: length header, then the JSON body.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the length header maps to
/// `Ok(None)`; EOF mid-frame or an oversized header is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32_le().await {
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
        Ok(length) if length as usize > MAX_FRAME => {
            return Err(RpcError::FrameTooLarge(length as usize))
        }
        Ok(length) => length,
    };

    let mut body = vec![0; length as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let frames = vec![
            Frame::Request(Request {
                id: 7,
                method: "obj.invoke".to_string(),
                params: vec![json!("LX1"), json!("onEnter"), json!({"from": "LY1"})],
            }),
            Frame::Response(Response::ok(7, json!({"moved": true}))),
            Frame::Response(Response::err(
                8,
                ErrorPayload::new(crate::code::METHOD_NOT_FOUND, "no such method"),
            )),
        ];

        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame).await.unwrap();
        }

        let mut reader = buf.as_slice();
        for expect in &frames {
            let got = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(&got, expect);
        }
        // Clean EOF maps to None.
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let buf = (u32::MAX).to_le_bytes().to_vec();
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, RpcError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Frame::Response(Response::ok(1, json!(null))),
        )
        .await
        .unwrap();
        buf.truncate(buf.len() - 2);

        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[test]
    fn test_wire_forms() {
        insta::assert_json_snapshot!(
            Frame::Request(Request {
                id: 1,
                method: "gs.ping".to_string(),
                params: vec![],
            }),
            @r###"
        {
          "id": 1,
          "method": "gs.ping",
          "params": []
        }
        "###
        );
        insta::assert_json_snapshot!(
            Frame::Response(Response::err(1, ErrorPayload::new(-32601, "nope"))),
            @r###"
        {
          "error": {
            "code": -32601,
            "message": "nope"
          },
          "id": 1
        }
        "###
        );
    }
}
