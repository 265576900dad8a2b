use bytemuck::Pod;
use half::f16;

mod sealed {
    pub trait Sealed {}
}

/// A plain element type the typed facade can move.
///
/// Each type owns one set of shared copy queues per device, keyed by [`Element::NAME`].
pub trait Element: Pod + Send + Sync + sealed::Sealed + 'static {
    const NAME: &'static str;
}

macro_rules! impl_element {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const NAME: &'static str = $name;
            }
        )*
    };
}

impl_element! {
    f32 => "float",
    f64 => "double",
    f16 => "half",
    i8 => "char",
    i16 => "short",
}
