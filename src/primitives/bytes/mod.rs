#![forbid(unsafe_code)]
//! Fixed-width encoders shared by the chunk store and its file header.

pub mod le {
    //! Little-endian cell accessors over byte slices.
    //!
    //! Callers bounds-check the whole span first; these helpers only panic on
    //! a slice that is shorter than the encoded width.

    use core::convert::TryInto;

    macro_rules! le_cell {
        ($get:ident, $put:ident, $ty:ty) => {
            /// Decodes a little-endian value at `off`.
            #[inline]
            pub fn $get(src: &[u8], off: usize) -> $ty {
                const LEN: usize = core::mem::size_of::<$ty>();
                let bytes: [u8; LEN] = src[off..off + LEN]
                    .try_into()
                    .unwrap_or_else(|_| panic!("cell at {} shorter than {} bytes", off, LEN));
                <$ty>::from_le_bytes(bytes)
            }

            /// Encodes a little-endian value at `off`.
            #[inline]
            pub fn $put(dst: &mut [u8], off: usize, v: $ty) {
                const LEN: usize = core::mem::size_of::<$ty>();
                dst[off..off + LEN].copy_from_slice(&v.to_le_bytes());
            }
        };
    }

    le_cell!(get_u16, put_u16, u16);
    le_cell!(get_i16, put_i16, i16);
    le_cell!(get_u32, put_u32, u32);
    le_cell!(get_i32, put_i32, i32);
    le_cell!(get_u64, put_u64, u64);
    le_cell!(get_i64, put_i64, i64);
    le_cell!(get_f32, put_f32, f32);
    le_cell!(get_f64, put_f64, f64);
}
