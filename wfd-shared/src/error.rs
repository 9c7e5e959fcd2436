use std::io;
use std::net;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //Session errors
    #[error("no such session")]
    ErrNoSuchSession,
    #[error("session already connected")]
    ErrSessionAlreadyConnected,
    #[error("session is not a UDP session")]
    ErrNotUdpSession,
    #[error("send queue overflow")]
    ErrSendQueueFull,
    #[error("connection reset by peer")]
    ErrConnectionReset,
    #[error("use of closed network connection")]
    ErrUseClosedNetworkConn,
    #[error("address already in use")]
    ErrAddressAlreadyInUse,
    #[error("failed to parse address")]
    ErrAddressParseFailed,
    #[error("invalid port number")]
    ErrInvalidPortNumber,
    #[error("port space exhausted")]
    ErrPortSpaceExhausted,

    //RTSP errors
    #[error("malformed RTSP message")]
    ErrMalformedRtspMessage,
    #[error("incomplete RTSP message")]
    ErrIncompleteRtspMessage,
    #[error("RTSP message is not a request")]
    ErrNotRtspRequest,
    #[error("RTSP message is not a response")]
    ErrNotRtspResponse,
    #[error("missing CSeq header")]
    ErrMissingCseq,
    #[error("no handler registered for response cseq {0}")]
    ErrUnmatchedResponse(i32),
    #[error("malformed text/parameters body")]
    ErrMalformedParameters,
    #[error("malformed wfd_video_formats spec")]
    ErrMalformedVideoFormats,
    #[error("malformed wfd_audio_codecs spec")]
    ErrMalformedAudioCodecs,
    #[error("malformed wfd_content_protection spec")]
    ErrMalformedContentProtection,
    #[error("no video format supported by both peers")]
    ErrNoCommonVideoFormat,
    #[error("unsupported transport specification")]
    ErrUnsupportedTransport,
    #[error("illegal state for request")]
    ErrIllegalRtspState,
    #[error("RTSP status {0}")]
    ErrRtspStatus(u16),

    //RTP errors
    #[error("RTP packet too short")]
    ErrRtpPacketTooShort,
    #[error("unsupported RTP version")]
    ErrUnsupportedRtpVersion,
    #[error("invalid RTP padding")]
    ErrInvalidRtpPadding,
    #[error("RTP payload exceeds MTU")]
    ErrPayloadTooLarge,
    #[error("access unit is not a whole number of TS packets")]
    ErrNotTsAligned,
    #[error("unregistered payload type {0}")]
    ErrUnregisteredPayloadType(u8),

    //RTCP errors
    #[error("RTCP packet too short")]
    ErrRtcpPacketTooShort,
    #[error("unsupported RTCP version")]
    ErrUnsupportedRtcpVersion,
    #[error("wrong RTCP packet type")]
    ErrWrongRtcpType,
    #[error("unsupported feedback format")]
    ErrUnsupportedFeedbackFormat,
    #[error("SDES text must be < 255 octets long")]
    ErrSdesTextTooLong,
    #[error("too many report blocks")]
    ErrTooManyReportBlocks,

    //Assembler errors
    #[error("malformed H264 RTP payload")]
    ErrMalformedH264Payload,
    #[error("malformed H264 FU-A fragment")]
    ErrMalformedFua,
    #[error("STAP-A declared size({0}) is larger than buffer({1})")]
    StapASizeLargerThanBuffer(usize, usize),
    #[error("nalu type {0} is currently not handled")]
    NaluTypeIsNotHandled(u8),

    //Transport stream errors
    #[error("unsupported track format")]
    ErrUnsupportedTrackFormat,
    #[error("no stream id left for stream type")]
    ErrStreamIdExhausted,
    #[error("no such track")]
    ErrNoSuchTrack,
    #[error("PES header does not fit in a transport packet")]
    ErrPesHeaderTooLarge,
    #[error("codec specific data missing")]
    ErrMissingCodecSpecificData,

    //Media pipeline errors
    #[error("converter is shutting down")]
    ErrConverterShuttingDown,
    #[error("encoder failed: {0}")]
    ErrEncoder(String),
    #[error("capture source failed: {0}")]
    ErrCaptureSource(String),
    #[error("HDCP encryption failed")]
    ErrHdcpEncrypt,
    #[error("HDCP initialization failed")]
    ErrHdcpInit,
    #[error("operation invalid in current state")]
    ErrInvalidOperation,
    #[error("track index out of range")]
    ErrTrackIndexOutOfRange,

    //Time sync errors
    #[error("malformed time sync packet")]
    ErrMalformedTimeSyncPacket,

    //Timeouts
    #[error("keep-alive timeout")]
    ErrKeepAliveTimeout,
    #[error("teardown trigger timed out")]
    ErrTeardownTimeout,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<net::AddrParseError> for Error {
    fn from(_: net::AddrParseError) -> Self {
        Error::ErrAddressParseFailed
    }
}
