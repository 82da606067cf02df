use std::convert::TryFrom;

use crate::Error;

/// STUN message class, the 2-bit field packed into the method word.
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// C1 and C0 together select Request (00), Indication (01), Success
/// Response (10) or Error Response (11).
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum MethodType {
    Request,
    Indication,
    Response,
    Error,
}

/// A STUN/TURN message method, already combined with its class.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Method {
    Binding(MethodType),
    Allocate(MethodType),
    CreatePermission(MethodType),
    ChannelBind(MethodType),
    Refresh(MethodType),
    SendIndication,
    DataIndication,
}

pub const BINDING_REQUEST: Method = Method::Binding(MethodType::Request);
pub const ALLOCATE_REQUEST: Method = Method::Allocate(MethodType::Request);
pub const CREATE_PERMISSION_REQUEST: Method = Method::CreatePermission(MethodType::Request);
pub const CHANNEL_BIND_REQUEST: Method = Method::ChannelBind(MethodType::Request);
pub const REFRESH_REQUEST: Method = Method::Refresh(MethodType::Request);
pub const SEND_INDICATION: Method = Method::SendIndication;
pub const DATA_INDICATION: Method = Method::DataIndication;

impl Method {
    /// Whether this method is an error response.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Method::Binding(MethodType::Error)
                | Method::Allocate(MethodType::Error)
                | Method::CreatePermission(MethodType::Error)
                | Method::ChannelBind(MethodType::Error)
                | Method::Refresh(MethodType::Error)
        )
    }

    /// The error-response variant of a request/success method.
    pub fn error(self) -> Self {
        match self {
            Self::Binding(_) => Self::Binding(MethodType::Error),
            Self::Allocate(_) => Self::Allocate(MethodType::Error),
            Self::CreatePermission(_) => Self::CreatePermission(MethodType::Error),
            Self::ChannelBind(_) => Self::ChannelBind(MethodType::Error),
            Self::Refresh(_) => Self::Refresh(MethodType::Error),
            other => other,
        }
    }

    /// The success-response variant of a request method.
    pub fn success(self) -> Self {
        match self {
            Self::Binding(_) => Self::Binding(MethodType::Response),
            Self::Allocate(_) => Self::Allocate(MethodType::Response),
            Self::CreatePermission(_) => Self::CreatePermission(MethodType::Response),
            Self::ChannelBind(_) => Self::ChannelBind(MethodType::Response),
            Self::Refresh(_) => Self::Refresh(MethodType::Response),
            other => other,
        }
    }
}

impl TryFrom<u16> for Method {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use turn_server_codec::message::methods::*;
    ///
    /// assert_eq!(Method::try_from(0x0001).unwrap(), Method::Binding(MethodType::Request));
    /// assert_eq!(Method::try_from(0x0101).unwrap(), Method::Binding(MethodType::Response));
    /// assert_eq!(Method::try_from(0x0111).unwrap(), Method::Binding(MethodType::Error));
    /// assert_eq!(Method::try_from(0x0003).unwrap(), Method::Allocate(MethodType::Request));
    /// assert_eq!(Method::try_from(0x0103).unwrap(), Method::Allocate(MethodType::Response));
    /// assert_eq!(Method::try_from(0x0113).unwrap(), Method::Allocate(MethodType::Error));
    /// assert_eq!(Method::try_from(0x0008).unwrap(), Method::CreatePermission(MethodType::Request));
    /// assert_eq!(Method::try_from(0x0108).unwrap(), Method::CreatePermission(MethodType::Response));
    /// assert_eq!(Method::try_from(0x0118).unwrap(), Method::CreatePermission(MethodType::Error));
    /// assert_eq!(Method::try_from(0x0009).unwrap(), Method::ChannelBind(MethodType::Request));
    /// assert_eq!(Method::try_from(0x0109).unwrap(), Method::ChannelBind(MethodType::Response));
    /// assert_eq!(Method::try_from(0x0119).unwrap(), Method::ChannelBind(MethodType::Error));
    /// assert_eq!(Method::try_from(0x0004).unwrap(), Method::Refresh(MethodType::Request));
    /// assert_eq!(Method::try_from(0x0104).unwrap(), Method::Refresh(MethodType::Response));
    /// assert_eq!(Method::try_from(0x0114).unwrap(), Method::Refresh(MethodType::Error));
    /// assert_eq!(Method::try_from(0x0016).unwrap(), Method::SendIndication);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), Method::DataIndication);
    /// assert!(Method::try_from(0xffff).is_err());
    /// ```
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0001 => Self::Binding(MethodType::Request),
            0x0101 => Self::Binding(MethodType::Response),
            0x0111 => Self::Binding(MethodType::Error),
            0x0003 => Self::Allocate(MethodType::Request),
            0x0103 => Self::Allocate(MethodType::Response),
            0x0113 => Self::Allocate(MethodType::Error),
            0x0008 => Self::CreatePermission(MethodType::Request),
            0x0108 => Self::CreatePermission(MethodType::Response),
            0x0118 => Self::CreatePermission(MethodType::Error),
            0x0009 => Self::ChannelBind(MethodType::Request),
            0x0109 => Self::ChannelBind(MethodType::Response),
            0x0119 => Self::ChannelBind(MethodType::Error),
            0x0004 => Self::Refresh(MethodType::Request),
            0x0104 => Self::Refresh(MethodType::Response),
            0x0114 => Self::Refresh(MethodType::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    /// # Test
    ///
    /// ```
    /// use turn_server_codec::message::methods::*;
    ///
    /// let value: u16 = Method::Binding(MethodType::Request).into();
    /// assert_eq!(value, 0x0001);
    /// ```
    fn from(value: Method) -> Self {
        match value {
            Method::Binding(MethodType::Request) => 0x0001,
            Method::Binding(MethodType::Response) => 0x0101,
            Method::Binding(MethodType::Error) => 0x0111,
            Method::Allocate(MethodType::Request) => 0x0003,
            Method::Allocate(MethodType::Response) => 0x0103,
            Method::Allocate(MethodType::Error) => 0x0113,
            Method::CreatePermission(MethodType::Request) => 0x0008,
            Method::CreatePermission(MethodType::Response) => 0x0108,
            Method::CreatePermission(MethodType::Error) => 0x0118,
            Method::ChannelBind(MethodType::Request) => 0x0009,
            Method::ChannelBind(MethodType::Response) => 0x0109,
            Method::ChannelBind(MethodType::Error) => 0x0119,
            Method::Refresh(MethodType::Request) => 0x0004,
            Method::Refresh(MethodType::Response) => 0x0104,
            Method::Refresh(MethodType::Error) => 0x0114,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
            // Indication/Response/Error combinations with no corresponding
            // wire value never escape this module's constructors.
            _ => unreachable!(),
        }
    }
}
