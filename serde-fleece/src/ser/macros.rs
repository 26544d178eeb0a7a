/// Build a dict of string keys and string values:
/// `fleece!({"name": "tester", "type": "user"})`
#[macro_export]
macro_rules! fleece {
    ({ $($key:tt : $value:tt),* }) => {{
        let mut enc = $crate::Encoder::new();
        let build = |enc: &mut $crate::Encoder| -> ::std::result::Result<(), $crate::Error> {
            enc.begin_dict(0)?;
            $(
                enc.write_key($key)?;
                enc.write_string($value)?;
            )*
            enc.end_dict()
        };
        match build(&mut enc) {
            Ok(()) => enc.finish(),
            Err(err) => Err(err),
        }
    }};
}
