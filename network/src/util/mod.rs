pub use self::router::{Routable, RouteKind, Router, RouterBuilder};
pub use self::traits::NetworkExt;

mod router;
mod traits;

/// Dispatches a TL request body by its constructor id.
#[macro_export]
macro_rules! match_tl_request {
    ($req_body:expr, {
        $($ty:path as $pat:pat => $expr:expr),*$(,)?
    }, $err:pat => $err_exr:expr) => {
        '__match_req: {
            let body: &[u8] = ($req_body).as_ref();
            let $err = match body.get(..4) {
                Some(id) => match u32::from_le_bytes([id[0], id[1], id[2], id[3]]) {
                    $(
                        <$ty>::TL_ID => match $crate::__internal::tl_proto::deserialize::<$ty>(body) {
                            Ok($pat) => break '__match_req ($expr),
                            Err(e) => e,
                        }
                    )*
                    _ => $crate::__internal::tl_proto::TlError::UnknownConstructor,
                },
                None => $crate::__internal::tl_proto::TlError::UnexpectedEof,
            };
            $err_exr
        }
    };
}
