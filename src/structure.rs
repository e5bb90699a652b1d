//! embedded-sdfat - Useful macros for parsing fixed-offset structures.
//!
//! Each accessor states its byte offset and byte order once, so the on-disk
//! and on-wire layouts are never re-derived at a call site. The implementing
//! type provides `data()` (and `data_mut()` for setters).

macro_rules! access_field {
    ($self:expr, $offset:expr, $start:expr, $num_bits:expr) => {
        ($self.data()[$offset] >> $start) & (((1u16 << $num_bits) - 1) as u8)
    };
}

macro_rules! define_field {
    ($name:ident, $type:ty, [ $( ( $offset:expr, $start_bit:expr, $num_bits:expr ) ),+ ]) => {
        doc_comment::doc_comment! {
            concat!(
                "Bit-field `", stringify!($name), "`, assembled most significant part first from ",
                $( "byte ", stringify!($offset), " bits ", stringify!($start_bit), "+", stringify!($num_bits), "; ", )+
            ),
            pub fn $name(&self) -> $type {
                let mut result: $type = 0;
                $(
                    result <<= $num_bits;
                    result |= access_field!(self, $offset, $start_bit, $num_bits) as $type;
                )+
                result
            }
        }
    };

    ($name:ident, u8, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Byte ", stringify!($offset), "."),
            pub fn $name(&self) -> u8 {
                self.data()[$offset]
            }
        }
    };

    ($name:ident, u16, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Little-endian `u16` at bytes ", stringify!($offset), "..+2."),
            pub fn $name(&self) -> u16 {
                let data = self.data();
                u16::from_le_bytes([data[$offset], data[$offset + 1]])
            }
        }
    };

    ($name:ident, u32, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Little-endian `u32` at bytes ", stringify!($offset), "..+4."),
            pub fn $name(&self) -> u32 {
                let data = self.data();
                u32::from_le_bytes([
                    data[$offset],
                    data[$offset + 1],
                    data[$offset + 2],
                    data[$offset + 3],
                ])
            }
        }
    };
}

macro_rules! define_setter {
    ($name:ident, u8, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Set byte ", stringify!($offset), "."),
            pub fn $name(&mut self, value: u8) {
                self.data_mut()[$offset] = value;
            }
        }
    };

    ($name:ident, u16, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Set the little-endian `u16` at bytes ", stringify!($offset), "..+2."),
            pub fn $name(&mut self, value: u16) {
                self.data_mut()[$offset..$offset + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
    };

    ($name:ident, u32, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Set the little-endian `u32` at bytes ", stringify!($offset), "..+4."),
            pub fn $name(&mut self, value: u32) {
                self.data_mut()[$offset..$offset + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    };
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
