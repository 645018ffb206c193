use crate::cmi::ScormVersion;

/// Error conditions the runtime API reports to content. Content sees the
/// version-specific numeric code, never a panic or a thrown error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmiError {
    General,
    InitFailed,
    AlreadyInitialized,
    ContentTerminated,
    TerminateBeforeInit,
    TerminateAfterTerminate,
    GetBeforeInit,
    GetAfterTerminate,
    SetBeforeInit,
    SetAfterTerminate,
    CommitBeforeInit,
    CommitAfterTerminate,
    InvalidArgument,
    GetFailure,
    SetFailure,
    CommitFailure,
    UndefinedElement,
    NotInitialized,
    SetKeyword,
    ReadOnly,
    WriteOnly,
    TypeMismatch,
    OutOfRange,
    NoChildren,
    NotAnArray,
    DependencyNotEstablished,
}

impl CmiError {
    pub fn code(self, version: ScormVersion) -> u16 {
        use CmiError::*;
        match version {
            ScormVersion::Scorm12 => match self {
                TerminateBeforeInit | GetBeforeInit | SetBeforeInit | CommitBeforeInit => 301,
                InvalidArgument | GetFailure | SetFailure | UndefinedElement | DependencyNotEstablished => 201,
                NoChildren => 202,
                NotAnArray => 203,
                SetKeyword => 402,
                ReadOnly => 403,
                WriteOnly => 404,
                TypeMismatch | OutOfRange => 405,
                // 1.2 returns "" with no error for unset elements; kept for completeness
                NotInitialized => 0,
                General | InitFailed | AlreadyInitialized | ContentTerminated | TerminateAfterTerminate
                | GetAfterTerminate | SetAfterTerminate | CommitAfterTerminate | CommitFailure => 101,
            },
            ScormVersion::Scorm2004 => match self {
                General => 101,
                InitFailed => 102,
                AlreadyInitialized => 103,
                ContentTerminated => 104,
                TerminateBeforeInit => 112,
                TerminateAfterTerminate => 113,
                GetBeforeInit => 122,
                GetAfterTerminate => 123,
                SetBeforeInit => 132,
                SetAfterTerminate => 133,
                CommitBeforeInit => 142,
                CommitAfterTerminate => 143,
                InvalidArgument => 201,
                GetFailure | NoChildren | NotAnArray => 301,
                SetFailure => 351,
                CommitFailure => 391,
                UndefinedElement => 401,
                NotInitialized => 403,
                SetKeyword | ReadOnly => 404,
                WriteOnly => 405,
                TypeMismatch => 406,
                OutOfRange => 407,
                DependencyNotEstablished => 408,
            },
        }
    }
}

pub fn error_string(version: ScormVersion, code: u16) -> &'static str {
    match (version, code) {
        (_, 0) => "No Error",
        (_, 101) => "General Exception",
        (ScormVersion::Scorm12, 201) => "Invalid argument error",
        (ScormVersion::Scorm12, 202) => "Element cannot have children",
        (ScormVersion::Scorm12, 203) => "Element not an array - cannot have count",
        (ScormVersion::Scorm12, 301) => "Not initialized",
        (ScormVersion::Scorm12, 401) => "Not implemented error",
        (ScormVersion::Scorm12, 402) => "Invalid set value, element is a keyword",
        (ScormVersion::Scorm12, 403) => "Element is read only",
        (ScormVersion::Scorm12, 404) => "Element is write only",
        (ScormVersion::Scorm12, 405) => "Incorrect data type",
        (ScormVersion::Scorm2004, 102) => "General Initialization Failure",
        (ScormVersion::Scorm2004, 103) => "Already Initialized",
        (ScormVersion::Scorm2004, 104) => "Content Instance Terminated",
        (ScormVersion::Scorm2004, 111) => "General Termination Failure",
        (ScormVersion::Scorm2004, 112) => "Termination Before Initialization",
        (ScormVersion::Scorm2004, 113) => "Termination After Termination",
        (ScormVersion::Scorm2004, 122) => "Retrieve Data Before Initialization",
        (ScormVersion::Scorm2004, 123) => "Retrieve Data After Termination",
        (ScormVersion::Scorm2004, 132) => "Store Data Before Initialization",
        (ScormVersion::Scorm2004, 133) => "Store Data After Termination",
        (ScormVersion::Scorm2004, 142) => "Commit Before Initialization",
        (ScormVersion::Scorm2004, 143) => "Commit After Termination",
        (ScormVersion::Scorm2004, 201) => "General Argument Error",
        (ScormVersion::Scorm2004, 301) => "General Get Failure",
        (ScormVersion::Scorm2004, 351) => "General Set Failure",
        (ScormVersion::Scorm2004, 391) => "General Commit Failure",
        (ScormVersion::Scorm2004, 401) => "Undefined Data Model Element",
        (ScormVersion::Scorm2004, 402) => "Unimplemented Data Model Element",
        (ScormVersion::Scorm2004, 403) => "Data Model Element Value Not Initialized",
        (ScormVersion::Scorm2004, 404) => "Data Model Element Is Read Only",
        (ScormVersion::Scorm2004, 405) => "Data Model Element Is Write Only",
        (ScormVersion::Scorm2004, 406) => "Data Model Element Type Mismatch",
        (ScormVersion::Scorm2004, 407) => "Data Model Element Value Out Of Range",
        (ScormVersion::Scorm2004, 408) => "Data Model Dependency Not Established",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_differ_per_version() {
        assert_eq!(CmiError::GetBeforeInit.code(ScormVersion::Scorm12), 301);
        assert_eq!(CmiError::GetBeforeInit.code(ScormVersion::Scorm2004), 122);
        assert_eq!(CmiError::UndefinedElement.code(ScormVersion::Scorm12), 201);
        assert_eq!(CmiError::UndefinedElement.code(ScormVersion::Scorm2004), 401);
        assert_eq!(CmiError::ReadOnly.code(ScormVersion::Scorm12), 403);
        assert_eq!(CmiError::ReadOnly.code(ScormVersion::Scorm2004), 404);
    }

    #[test]
    fn every_code_has_a_string() {
        for v in [ScormVersion::Scorm12, ScormVersion::Scorm2004] {
            for e in [
                CmiError::General,
                CmiError::AlreadyInitialized,
                CmiError::InvalidArgument,
                CmiError::WriteOnly,
                CmiError::TypeMismatch,
                CmiError::SetFailure,
            ] {
                assert!(!error_string(v, e.code(v)).is_empty(), "{e:?} in {v}");
            }
        }
    }
}
