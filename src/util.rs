use byteorder::{ByteOrder, LittleEndian};
use Error;

#[macro_export]
macro_rules! try_option {
    ( $a: expr ) => {
        match $a {
            Some(v) => v,
            None    => return,
        }
    }
}

#[macro_export]
macro_rules! clamp {
    ( $a:ident, $min:expr, $max:expr ) => {
        if $a < $min {
            $a = $min
        } else if $a > $max {
            $a = $max
        }
    }
}


/// Bounds-checked reads from a little-endian byte buffer.
pub trait BinaryRead<'a> {
    fn read16l(self, ofs: usize) -> Result<u16, Error>;
    fn read16li(self, ofs: usize) -> Result<i16, Error>;
    fn read8(self, ofs: usize) -> Result<u8, Error>;
    fn slice(self, start: usize, size: usize) -> Result<&'a [u8], Error>;
}

impl<'a> BinaryRead<'a> for &'a [u8] {
    fn read16l(self, ofs: usize) -> Result<u16, Error> {
        check_buffer_size(self, ofs + 2)?;
        Ok(LittleEndian::read_u16(&self[ofs..ofs+2]))
    }

    fn read16li(self, ofs: usize) -> Result<i16, Error> {
        check_buffer_size(self, ofs + 2)?;
        Ok(LittleEndian::read_i16(&self[ofs..ofs+2]))
    }

    fn read8(self, ofs: usize) -> Result<u8, Error> {
        check_buffer_size(self, ofs + 1)?;
        Ok(self[ofs])
    }

    fn slice(self, start: usize, size: usize) -> Result<&'a [u8], Error> {
        check_buffer_size(self, start + size)?;
        Ok(&self[start..start + size])
    }
}

fn check_buffer_size(b: &[u8], end: usize) -> Result<(), Error> {
    if end > b.len() {
        return Err(Error::InvalidData(format!("short read (want {} bytes, have {})", end, b.len())))
    }
    Ok(())
}
