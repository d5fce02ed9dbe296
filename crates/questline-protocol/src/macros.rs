/// Declares a `#[repr(u8)]` enum that travels as a single byte.
///
/// Generates `From<Enum> for u8` and `TryFrom<u8> for Enum`, the latter
/// failing with [`ProtocolError::UnknownTag`](crate::ProtocolError) so an
/// unexpected byte is never silently mapped to a default.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident as $kind:literal {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $value:literal,
            )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant = $value,
            )+
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = $crate::ProtocolError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err($crate::ProtocolError::UnknownTag {
                        kind: $kind,
                        value,
                    }),
                }
            }
        }
    };
}
