//! Bidirectional XDR traversals.
//!
//! A type describes its wire layout once, in [`XdrType::xdr`], and the same
//! description is used to encode it, decode it and release whatever a decode
//! allocated.  Which of the three happens depends on [`Xdr::op`].
//!
//! Decoding into a `Vec`, `String` or `Option<Box<_>>` allocates storage.  The
//! free traversal empties those containers again, so running it a second time
//! finds nothing left to release.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::xdr::{Result, Xdr, XdrError, XdrOp};

/// A value with an XDR wire representation.
pub trait XdrType {
    /// Encode, decode or free `self` according to `xdrs.op()`.
    fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()>;
}

macro_rules! xdr_int {
    ($ty:ty, $send:ident, $recv:ident) => {
        impl XdrType for $ty {
            fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
                match xdrs.op() {
                    XdrOp::Encode => xdrs.$send(*self),
                    XdrOp::Decode => {
                        *self = xdrs.$recv()?;
                        Ok(())
                    }
                    XdrOp::Free => Ok(()),
                }
            }
        }
    };
}

xdr_int!(u32, send_u32, recv_u32);
xdr_int!(i32, send_i32, recv_i32);
xdr_int!(u16, send_u16, recv_u16);
xdr_int!(i16, send_i16, recv_i16);
xdr_int!(u8, send_u8, recv_u8);
xdr_int!(i8, send_i8, recv_i8);

impl XdrType for bool {
    fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
        match xdrs.op() {
            XdrOp::Encode => xdrs.send_u32(u32::from(*self)),
            XdrOp::Decode => {
                *self = xdrs.recv_u32()? != 0;
                Ok(())
            }
            XdrOp::Free => Ok(()),
        }
    }
}

// Hyper integers: high word first.
impl XdrType for u64 {
    fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
        match xdrs.op() {
            XdrOp::Encode => {
                xdrs.send_u32((*self >> 32) as u32)?;
                xdrs.send_u32(*self as u32)
            }
            XdrOp::Decode => {
                let high = xdrs.recv_u32()?;
                let low = xdrs.recv_u32()?;
                *self = (u64::from(high) << 32) | u64::from(low);
                Ok(())
            }
            XdrOp::Free => Ok(()),
        }
    }
}

impl XdrType for i64 {
    fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
        let mut raw = *self as u64;
        raw.xdr(xdrs)?;
        *self = raw as i64;
        Ok(())
    }
}

/// Void
impl XdrType for () {
    fn xdr(&mut self, _xdrs: &mut Xdr) -> Result<()> {
        Ok(())
    }
}

/// Optional data, sent as a presence boolean followed by the value.
impl<T: XdrType + Default> XdrType for Option<Box<T>> {
    fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
        xdr_pointer(xdrs, self)
    }
}

/// Adapter turning a closure into an [`XdrType`], for hand-written
/// argument and result procedures.
///
/// ```rust
/// use oncrpc_router::xdr::{Xdr, XdrFn, XdrType, xdr_string};
///
/// let mut name = Some(String::from("gps"));
/// let mut id = 7u32;
/// let mut args = XdrFn(|xdrs: &mut Xdr| {
///     id.xdr(xdrs)?;
///     xdr_string(xdrs, &mut name, 32)
/// });
/// let mut xdr = Xdr::new();
/// args.xdr(&mut xdr).unwrap();
/// ```
pub struct XdrFn<F>(pub F);

impl<F> XdrType for XdrFn<F>
where
    F: FnMut(&mut Xdr) -> Result<()>,
{
    fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
        (self.0)(xdrs)
    }
}

/// Fixed-length opaque data.  Storage is the caller's, so freeing is a no-op.
pub fn xdr_opaque(xdrs: &mut Xdr, data: &mut [u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match xdrs.op() {
        XdrOp::Encode => xdrs.send_bytes(data),
        XdrOp::Decode => xdrs.recv_bytes(data),
        XdrOp::Free => Ok(()),
    }
}

/// Counted opaque data of at most `max` bytes.
pub fn xdr_bytes(xdrs: &mut Xdr, data: &mut Vec<u8>, max: u32) -> Result<()> {
    match xdrs.op() {
        XdrOp::Encode => {
            let len = check_len(data.len(), max)?;
            xdrs.send_u32(len)?;
            xdrs.send_bytes(data)
        }
        XdrOp::Decode => {
            let len = xdrs.recv_u32()?;
            if len > max {
                return Err(XdrError::TooLong { len, max });
            }
            data.clear();
            data.resize(len as usize, 0);
            xdrs.recv_bytes(data)
        }
        XdrOp::Free => {
            *data = Vec::new();
            Ok(())
        }
    }
}

/// Counted string of at most `max` bytes.  Encoding `None` is an error.
pub fn xdr_string(xdrs: &mut Xdr, s: &mut Option<String>, max: u32) -> Result<()> {
    match xdrs.op() {
        XdrOp::Encode => {
            let s = s.as_deref().ok_or(XdrError::NullString)?;
            let len = check_len(s.len(), max)?;
            xdrs.send_u32(len)?;
            xdrs.send_bytes(s.as_bytes())
        }
        XdrOp::Decode => {
            let len = xdrs.recv_u32()?;
            if len > max {
                return Err(XdrError::TooLong { len, max });
            }
            let mut buf = vec![0u8; len as usize];
            xdrs.recv_bytes(&mut buf)?;
            *s = Some(String::from_utf8(buf).map_err(|_| XdrError::Utf8)?);
            Ok(())
        }
        XdrOp::Free => {
            *s = None;
            Ok(())
        }
    }
}

/// Fixed-length array.  Each element is traversed, the storage itself is not
/// released.
pub fn xdr_vector<T: XdrType>(xdrs: &mut Xdr, items: &mut [T]) -> Result<()> {
    items.iter_mut().try_for_each(|item| item.xdr(xdrs))
}

/// Counted array of at most `max` elements.
///
/// Decoding replaces the contents of `items` with `count` default-initialised
/// elements and then decodes each one.  The count is checked against `max`
/// before anything is allocated.
pub fn xdr_array<T: XdrType + Default>(xdrs: &mut Xdr, items: &mut Vec<T>, max: u32) -> Result<()> {
    match xdrs.op() {
        XdrOp::Encode => {
            let count = check_len(items.len(), max)?;
            xdrs.send_u32(count)?;
            xdr_vector(xdrs, items)
        }
        XdrOp::Decode => {
            let count = xdrs.recv_u32()?;
            if count > max {
                return Err(XdrError::TooLong { len: count, max });
            }
            items.clear();
            items.resize_with(count as usize, T::default);
            xdr_vector(xdrs, items)
        }
        XdrOp::Free => {
            let result = xdr_vector(xdrs, items);
            *items = Vec::new();
            result
        }
    }
}

/// Data behind a pointer that is always present on the wire.
///
/// Decoding allocates a default value when `p` is `None`; freeing traverses
/// the value and then drops it.
pub fn xdr_reference<T: XdrType + Default>(xdrs: &mut Xdr, p: &mut Option<Box<T>>) -> Result<()> {
    if p.is_none() {
        match xdrs.op() {
            XdrOp::Free => return Ok(()),
            XdrOp::Decode => *p = Some(Box::default()),
            XdrOp::Encode => {}
        }
    }
    let result = match p.as_deref_mut() {
        Some(value) => value.xdr(xdrs),
        None => Err(XdrError::InvalidValue {
            what: "reference",
            value: 0,
        }),
    };
    if xdrs.op() == XdrOp::Free {
        *p = None;
    }
    result
}

/// Optional data: a presence boolean, then the value when present.
pub fn xdr_pointer<T: XdrType + Default>(xdrs: &mut Xdr, p: &mut Option<Box<T>>) -> Result<()> {
    let mut more_data = p.is_some();
    more_data.xdr(xdrs)?;
    if !more_data {
        *p = None;
        return Ok(());
    }
    xdr_reference(xdrs, p)
}

/// Enum value occupying `width` bytes in memory, sent as one XDR unit.
pub fn xdr_enum(xdrs: &mut Xdr, value: &mut i32, width: usize) -> Result<()> {
    match xdrs.op() {
        XdrOp::Encode => xdrs.send_enum(*value, width),
        XdrOp::Decode => {
            *value = xdrs.recv_enum(width)?;
            Ok(())
        }
        XdrOp::Free => Ok(()),
    }
}

fn check_len(len: usize, max: u32) -> Result<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= max => Ok(len),
        _ => Err(XdrError::TooLong {
            len: u32::try_from(len).unwrap_or(u32::MAX),
            max,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Fix {
        id: u32,
        label: Option<String>,
        samples: Vec<i16>,
        next: Option<Box<Fix>>,
    }

    impl XdrType for Fix {
        fn xdr(&mut self, xdrs: &mut Xdr) -> Result<()> {
            self.id.xdr(xdrs)?;
            xdr_string(xdrs, &mut self.label, 16)?;
            xdr_array(xdrs, &mut self.samples, 8)?;
            xdr_pointer(xdrs, &mut self.next)
        }
    }

    fn encode<T: XdrType>(value: &mut T) -> Vec<u8> {
        let mut xdr = Xdr::new();
        value.xdr(&mut xdr).unwrap();
        xdr.out_msg().to_vec()
    }

    fn sample() -> Fix {
        Fix {
            id: 1,
            label: Some("first".into()),
            samples: vec![-1, 2, 3],
            next: Some(Box::new(Fix {
                id: 2,
                label: Some(String::new()),
                samples: vec![],
                next: None,
            })),
        }
    }

    #[test]
    fn nested_structure_decodes() {
        let mut original = sample();
        let wire = encode(&mut original);

        let mut rx = Xdr::from_inbound(wire);
        let mut decoded = Fix::default();
        decoded.xdr(&mut rx).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(rx.in_remaining(), 0);
    }

    #[test]
    fn free_releases_and_is_idempotent() {
        let wire = encode(&mut sample());
        let mut rx = Xdr::from_inbound(wire);
        let mut decoded = Fix::default();
        decoded.xdr(&mut rx).unwrap();

        rx.set_op(XdrOp::Free);
        decoded.xdr(&mut rx).unwrap();
        assert_eq!(decoded.label, None);
        assert!(decoded.samples.is_empty());
        assert!(decoded.next.is_none());

        decoded.xdr(&mut rx).unwrap();
        assert_eq!(decoded, Fix { id: 1, ..Fix::default() });
    }

    #[test]
    fn array_at_max_decodes() {
        let mut items = vec![7u32; 4];
        let wire = encode(&mut XdrFn(|x: &mut Xdr| xdr_array(x, &mut items, 4)));

        let mut rx = Xdr::from_inbound(wire);
        let mut out: Vec<u32> = Vec::new();
        xdr_array(&mut rx, &mut out, 4).unwrap();
        assert_eq!(out, vec![7; 4]);
    }

    #[test]
    fn array_over_max_fails_before_allocating() {
        // Count claims a million elements but the message has none of them.
        let mut rx = Xdr::from_inbound(1_000_000u32.to_be_bytes().to_vec());
        let mut out: Vec<u64> = Vec::new();
        assert_eq!(
            xdr_array(&mut rx, &mut out, 16),
            Err(XdrError::TooLong {
                len: 1_000_000,
                max: 16
            })
        );
        assert_eq!(out.capacity(), 0);
    }

    #[test]
    fn string_bounds() {
        let mut s = Some("abcd".to_string());
        let wire = encode(&mut XdrFn(|x: &mut Xdr| xdr_string(x, &mut s, 4)));

        let mut rx = Xdr::from_inbound(wire.clone());
        let mut out = None;
        xdr_string(&mut rx, &mut out, 4).unwrap();
        assert_eq!(out.as_deref(), Some("abcd"));

        let mut rx = Xdr::from_inbound(wire);
        let mut out = None;
        assert_eq!(
            xdr_string(&mut rx, &mut out, 3),
            Err(XdrError::TooLong { len: 4, max: 3 })
        );
        assert_eq!(out, None);
    }

    #[test]
    fn encoding_missing_string_fails() {
        let mut xdr = Xdr::new();
        assert_eq!(xdr_string(&mut xdr, &mut None, 8), Err(XdrError::NullString));
    }

    #[test]
    fn bytes_over_max_rejected_on_encode() {
        let mut xdr = Xdr::new();
        let mut data = vec![0u8; 9];
        assert_eq!(
            xdr_bytes(&mut xdr, &mut data, 8),
            Err(XdrError::TooLong { len: 9, max: 8 })
        );
        assert!(xdr.out_msg().is_empty());
    }

    #[test]
    fn pointer_absent_is_single_word() {
        let mut p: Option<Box<u32>> = None;
        assert_eq!(encode(&mut p), vec![0, 0, 0, 0]);
    }

    #[test]
    fn hyper_high_word_first() {
        let mut v = 0x0102_0304_0506_0708u64;
        assert_eq!(encode(&mut v), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn opaque_is_padded_and_unframed() {
        let mut data = *b"abcde";
        let wire = encode(&mut XdrFn(|x: &mut Xdr| xdr_opaque(x, &mut data)));
        assert_eq!(wire, b"abcde\0\0\0");

        let mut rx = Xdr::from_inbound(wire);
        let mut out = [0u8; 5];
        xdr_opaque(&mut rx, &mut out).unwrap();
        assert_eq!(&out, b"abcde");
        assert_eq!(rx.in_remaining(), 0);

        // Nothing at all on the wire for an empty block
        let wire = encode(&mut XdrFn(|x: &mut Xdr| xdr_opaque(x, &mut [])));
        assert!(wire.is_empty());
    }

    #[test]
    fn enum_widths() {
        for width in [1, 2, 4] {
            let mut value = -2;
            let wire = encode(&mut XdrFn(|x: &mut Xdr| xdr_enum(x, &mut value, width)));
            assert_eq!(wire, vec![0xFF, 0xFF, 0xFF, 0xFE]);

            let mut rx = Xdr::from_inbound(wire);
            let mut out = 0;
            xdr_enum(&mut rx, &mut out, width).unwrap();
            assert_eq!(out, -2);
        }

        let mut xdr = Xdr::new();
        assert_eq!(xdr_enum(&mut xdr, &mut 1, 3), Err(XdrError::EnumWidth(3)));
    }

    #[test]
    fn reference_has_no_presence_word() {
        let mut p = Some(Box::new(9u32));
        let wire = encode(&mut XdrFn(|x: &mut Xdr| xdr_reference(x, &mut p)));
        assert_eq!(wire, vec![0, 0, 0, 9]);

        // Decoding allocates the target
        let mut rx = Xdr::from_inbound(wire);
        let mut out: Option<Box<u32>> = None;
        xdr_reference(&mut rx, &mut out).unwrap();
        assert_eq!(out.as_deref(), Some(&9));

        rx.set_op(XdrOp::Free);
        xdr_reference(&mut rx, &mut out).unwrap();
        assert!(out.is_none());

        // There is nothing to encode through a missing reference
        let mut xdr = Xdr::new();
        let mut missing: Option<Box<u32>> = None;
        assert!(matches!(
            xdr_reference(&mut xdr, &mut missing),
            Err(XdrError::InvalidValue { .. })
        ));
    }
}
