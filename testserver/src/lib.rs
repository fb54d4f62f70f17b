mod closing;
mod mock;
mod psg;
mod request;
mod responder;
mod response;

pub use closing::ClosingServer;
pub use mock::{Builder, Mock};
pub use psg::ReplyBody;
pub use request::Request;
pub use responder::Responder;
pub use response::Response;

/// Macro to define a mock endpoint using a more concise DSL.
#[macro_export]
macro_rules! mock {
    (@response($response:expr) status: $status:expr, $($tail:tt)*) => {{
        let mut response = $response;

        response.status_code = $status as u16;

        $crate::mock!(@response(response) $($tail)*)
    }};

    (@response($response:expr) body: $body:expr, $($tail:tt)*) => {{
        let mut response = $response;

        response.body = ::std::convert::AsRef::<[u8]>::as_ref(&$body).to_vec();

        $crate::mock!(@response(response) $($tail)*)
    }};

    (@response($response:expr) delay: $delay:tt, $($tail:tt)*) => {{
        let mut response = $response;

        response.delay = Some($crate::helpers::parse_duration(stringify!($delay)));

        $crate::mock!(@response(response) $($tail)*)
    }};

    (@response($response:expr) reset: $code:expr, $($tail:tt)*) => {{
        let mut response = $response;

        response.reset = Some($code as u32);

        $crate::mock!(@response(response) $($tail)*)
    }};

    (@response($response:expr) headers {
        $(
            $name:literal: $value:expr,
        )*
    } $($tail:tt)*) => {{
        let mut response = $response;

        $(
            response.headers.push(($name.to_string(), $value.to_string()));
        )*

        $crate::mock!(@response(response) $($tail)*)
    }};

    (@response($response:expr)) => {{
        $response
    }};

    ($($inner:tt)*) => {{
        $crate::Mock::new(move |_: $crate::Request| {
            let response = $crate::Response::default();

            Some($crate::mock!(@response(response) $($inner)*))
        })
    }};
}

#[doc(hidden)]
pub mod helpers {
    use std::time::Duration;

    pub fn parse_duration(s: &str) -> Duration {
        humantime::parse_duration(s).unwrap()
    }
}
