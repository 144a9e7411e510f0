pub type StrResult<T = ()> = Result<T, String>;

fn default_show_error_fn(_: &str) {}
pub static mut _SHOW_ERROR_CB: fn(&str) = default_show_error_fn;

#[macro_export]
macro_rules! show_err_str {
    ($fmt:expr $(, $args:expr)*) => {{
        log::error!($fmt $(, $args)*);
        unsafe { $crate::logging::_SHOW_ERROR_CB(&format!($fmt $(, $args)*)) };
    }};
}

pub fn set_show_error_fn(cb: fn(&str)) {
    unsafe { _SHOW_ERROR_CB = cb };
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|m| m.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Unavailable".into());
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        show_err_str!(
            "VRFX panicked. This is a bug.\nMessage: {:?} ({})\nBacktrace:\n{:?}",
            message,
            location,
            backtrace::Backtrace::new()
        )
    }))
}

#[macro_export]
macro_rules! trace_str {
    ($expect_fmt:expr $(, $args:expr)*) => {
        Err(format!("[{}] At {}:{}", TRACE_CONTEXT, file!(), line!()) +
            ", " + &format!($expect_fmt $(, $args)*))
    };
}

#[macro_export]
macro_rules! trace_err {
    ($res:expr $(, $expect_fmt:expr $(, $args:expr)*)?) => {
        $res.map_err(|e| {
            format!("[{}] At {}:{}", TRACE_CONTEXT, file!(), line!())
                $(+ ", " + &format!($expect_fmt $(, $args)*))? +
                &format!(":\n{:?}", e)
        })
    };
}

#[macro_export]
macro_rules! trace_none {
    ($res:expr $(, $none_message_fmt:expr $(, $args:expr)*)?) => {
        $res.ok_or_else(|| {
            format!("[{}] At {}:{}", TRACE_CONTEXT, file!(), line!())
                $(+ ", " + &format!($none_message_fmt $(, $args)*))?
        })
    };
}

#[macro_export]
macro_rules! show_err {
    ($res:expr) => {
        $res.map_err(|e| {
            log::error!("{}", e);
            unsafe { $crate::logging::_SHOW_ERROR_CB(&format!("{}", e)) };
        })
    };
}

#[cfg(test)]
mod tests {
    const TRACE_CONTEXT: &str = "Logging test";

    fn failing_parse(text: &str) -> crate::StrResult<u32> {
        trace_err!(text.parse::<u32>(), "Parsing {}", text)
    }

    #[test]
    fn trace_err_carries_context_and_cause() {
        let message = failing_parse("abc").unwrap_err();
        assert!(message.starts_with("[Logging test] At "));
        assert!(message.contains("Parsing abc"));
        assert!(message.contains("ParseIntError"));
    }

    #[test]
    fn trace_none_and_trace_str() {
        let res: crate::StrResult<u32> = trace_none!(None::<u32>, "missing {}", 3);
        assert!(res.unwrap_err().ends_with("missing 3"));

        let res: crate::StrResult = trace_str!("bad value {}", 7);
        assert!(res.unwrap_err().ends_with(", bad value 7"));

        assert_eq!(failing_parse("12"), Ok(12));
    }
}
