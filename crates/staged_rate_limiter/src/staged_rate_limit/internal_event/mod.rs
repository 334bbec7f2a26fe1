//! Metrics and stats logging of the staged rate controller.
//!
//! Every event registers its metric handles once, labelled with the controller name, and
//! is emitted on the hot path without further lookups.

/// Declares an event struct holding pre-registered metric handles.
///
/// ```ignore
/// registered_event! {
///     MyEvent { name: String } => {
///         calls: Counter = counter!("my_calls_total", "name" => name.clone()),
///     }
///
///     fn emit(&self, count: u64) {
///         self.calls.increment(count);
///     }
/// }
/// ```
macro_rules! registered_event {
    (
        $event:ident { $($param:ident: $param_ty:ty),* $(,)? } => {
            $($field:ident: $field_ty:ty = $value:expr,)*
        }

        fn emit(&$slf:ident, $data:ident: $data_ty:ty) $body:block
    ) => {
        #[derive(Clone)]
        pub struct $event {
            $($param: $param_ty,)*
            $($field: $field_ty,)*
        }

        impl $event {
            pub fn register($($param: $param_ty),*) -> Self {
                $(let $field = $value;)*
                Self { $($param,)* $($field,)* }
            }

            pub fn emit(&$slf, $data: $data_ty) $body
        }
    };
}

mod staged_rate_limit;

pub use staged_rate_limit::*;
