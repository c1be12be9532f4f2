//! Declarative helpers for the protocol enums.

/// Defines `CommandType` with `#[repr(u32)]` discriminants and a `from_u32` lookup.
macro_rules! define_command_type {
    ($($variant:ident = $code:expr),* $(,)?) => {
        /// Tuya command codes carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($variant = $code),*
        }

        impl CommandType {
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $(c if c == $code => Some(CommandType::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

/// Defines `Version` with its string form and numeric value.
macro_rules! define_version {
    ($($variant:ident = ($text:expr, $val:expr)),* $(,)?) => {
        /// Tuya local protocol version.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($variant),*
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$variant => $text),*
                }
            }

            /// Version prefix as it appears in protocol headers (e.g. `b"3.3"`).
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$variant => $val),*
                }
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Version::$variant),)*
                    other => Err($crate::error::TuyaError::DecodeError(format!(
                        "unknown protocol version: {}",
                        other
                    ))),
                }
            }
        }
    };
}
