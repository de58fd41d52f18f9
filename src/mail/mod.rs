mod translator;

pub use translator::{
    BodyKind, Envelope, TranslateError, UpstreamAttachment, UpstreamBody, UpstreamMessage, parse,
    sender_address, translate,
};
