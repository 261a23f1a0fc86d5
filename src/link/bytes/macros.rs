/// Generates typed getters for one integer type, in both byte orders.
macro_rules! register_getters {
    ($($type:ty),+ $(,)?) => {
        $(
            paste::paste! {
                #[doc = "Decodes a little-endian `" $type "` starting at `offset`."]
                #[doc = ""]
                #[doc = "# Panics"]
                #[doc = "Panics if the value runs past the end of the bytes."]
                #[inline]
                pub fn [<$type _le_at>](&self, offset: usize) -> $type {
                    const SIZE: usize = core::mem::size_of::<$type>();
                    let mut raw = [0u8; SIZE];
                    raw.copy_from_slice(&self.bytes()[offset..offset + SIZE]);
                    <$type>::from_le_bytes(raw)
                }

                #[doc = "Decodes a big-endian `" $type "` starting at `offset`."]
                #[doc = ""]
                #[doc = "# Panics"]
                #[doc = "Panics if the value runs past the end of the bytes."]
                #[inline]
                pub fn [<$type _be_at>](&self, offset: usize) -> $type {
                    const SIZE: usize = core::mem::size_of::<$type>();
                    let mut raw = [0u8; SIZE];
                    raw.copy_from_slice(&self.bytes()[offset..offset + SIZE]);
                    <$type>::from_be_bytes(raw)
                }
            }
        )+
    };
}

/// Generates typed setters for one integer type, in both byte orders.
macro_rules! register_setters {
    ($($type:ty),+ $(,)?) => {
        $(
            paste::paste! {
                #[doc = "Encodes `value` as a little-endian `" $type "` starting at `offset`."]
                #[doc = ""]
                #[doc = "# Panics"]
                #[doc = "Panics if the value runs past the end of the bytes."]
                #[inline]
                pub fn [<set_ $type _le_at>](&mut self, offset: usize, value: $type) {
                    let raw = value.to_le_bytes();
                    self.0[offset..offset + raw.len()].copy_from_slice(&raw);
                }

                #[doc = "Encodes `value` as a big-endian `" $type "` starting at `offset`."]
                #[doc = ""]
                #[doc = "# Panics"]
                #[doc = "Panics if the value runs past the end of the bytes."]
                #[inline]
                pub fn [<set_ $type _be_at>](&mut self, offset: usize, value: $type) {
                    let raw = value.to_be_bytes();
                    self.0[offset..offset + raw.len()].copy_from_slice(&raw);
                }
            }
        )+
    };
}
