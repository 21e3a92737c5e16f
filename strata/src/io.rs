//! This module provides read and write extension traits for the types stored in region
//! files.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{self, Read, Write};

use glam::{IVec2, DVec2};


/// Extension trait with region file read methods.
pub trait ReadStrataExt: Read {

    #[inline]
    fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    #[inline]
    fn read_ivec2(&mut self) -> io::Result<IVec2> {
        Ok(IVec2::new(self.read_i32::<LE>()?, self.read_i32::<LE>()?))
    }

    #[inline]
    fn read_dvec2(&mut self) -> io::Result<DVec2> {
        Ok(DVec2::new(self.read_f64::<LE>()?, self.read_f64::<LE>()?))
    }

    fn read_string8(&mut self) -> io::Result<String> {

        let len = self.read_u16::<LE>()?;
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;

        String::from_utf8(buf).map_err(|_| new_invalid_data_err("invalid utf-8 string"))

    }

}

/// Extension trait with region file write methods.
pub trait WriteStrataExt: Write {

    #[inline]
    fn write_bool(&mut self, b: bool) -> io::Result<()> {
        self.write_u8(b as u8)
    }

    #[inline]
    fn write_ivec2(&mut self, v: IVec2) -> io::Result<()> {
        self.write_i32::<LE>(v.x)?;
        self.write_i32::<LE>(v.y)
    }

    #[inline]
    fn write_dvec2(&mut self, v: DVec2) -> io::Result<()> {
        self.write_f64::<LE>(v.x)?;
        self.write_f64::<LE>(v.y)
    }

    fn write_string8(&mut self, s: &str) -> io::Result<()> {

        if s.len() > u16::MAX as usize {
            return Err(new_invalid_data_err("string too big"));
        }

        self.write_u16::<LE>(s.len() as u16)?;
        self.write_all(s.as_bytes())

    }

}

impl<R: Read> ReadStrataExt for R {}
impl<W: Write> WriteStrataExt for W {}


/// Return an invalid data io error with specific message.
pub(crate) fn new_invalid_data_err(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn strings_and_vectors() {
        let mut buf = Vec::new();
        buf.write_string8("dungeon").unwrap();
        buf.write_ivec2(IVec2::new(-5, 70)).unwrap();
        buf.write_dvec2(DVec2::new(0.5, -3.25)).unwrap();
        buf.write_bool(true).unwrap();
        let mut reader = &buf[..];
        assert_eq!(reader.read_string8().unwrap(), "dungeon");
        assert_eq!(reader.read_ivec2().unwrap(), IVec2::new(-5, 70));
        assert_eq!(reader.read_dvec2().unwrap(), DVec2::new(0.5, -3.25));
        assert!(reader.read_bool().unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn invalid_utf8() {
        let buf = [2u8, 0, 0xFF, 0xFE];
        let err = (&buf[..]).read_string8().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

}
