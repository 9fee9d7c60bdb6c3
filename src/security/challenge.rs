//! Challenge tokens and pages.
//!
//! A challenged client must come back with the query parameter `_l1O0`
//! set to its token. The page presenting the token depends on the vhost's
//! challenge mode.

use base64::Engine;
use rand::Rng;

/// Query parameter carrying the challenge answer.
pub const TOKEN_PARAM: &str = "_l1O0";

/// Path serving the CAPTCHA image.
pub const CAPTCHA_PATH: &str = "/anti-ddos/code.png";

/// Token alphabet without look-alike characters (no l, o, I, O, 0, 1).
const ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ATTACKED_BODY: &str = "the site was been attacked!";

/// How a challenge is presented. Config codes: 10, 11, 3, anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeMode {
    /// Script redirect to the tokenized URL.
    JsRedirect,
    /// Delayed script redirect; the URL is XOR-obfuscated and base64 encoded.
    JsTimeout,
    /// HTML form with a CAPTCHA image.
    Captcha,
    /// Plain text notice.
    #[default]
    Text,
}

impl ChallengeMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            10 => ChallengeMode::JsRedirect,
            11 => ChallengeMode::JsTimeout,
            3 => ChallengeMode::Captcha,
            _ => ChallengeMode::Text,
        }
    }
}

/// Random string of `len` characters from the token alphabet.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Fresh challenge token, 3 to 7 characters.
pub fn generate_token() -> String {
    let len = rand::thread_rng().gen_range(3..=7);
    random_string(len)
}

/// Case-insensitive token comparison. Empty answers never match.
pub fn token_matches(answer: &str, expected: &str) -> bool {
    !answer.is_empty() && answer.eq_ignore_ascii_case(expected)
}

/// `url` (path and query) with `_l1O0` set to `token`, other parameters kept.
pub fn tokenized_url(url: &str, token: &str) -> String {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let mut out = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        if k != TOKEN_PARAM {
            out.append_pair(&k, &v);
        }
    }
    out.append_pair(TOKEN_PARAM, token);
    format!("{}?{}", path, out.finish())
}

/// XOR every character of `input` with the repeating `key`.
pub fn xor_crypt(input: &str, key: &str) -> String {
    let key: Vec<u32> = key.chars().map(u32::from).collect();
    if key.is_empty() {
        return input.to_string();
    }
    input
        .chars()
        .enumerate()
        .map(|(i, c)| char::from_u32(u32::from(c) ^ key[i % key.len()]).unwrap_or(c))
        .collect()
}

/// Page body for `mode` that leads the client to `url` carrying `token`.
pub fn challenge_body(mode: ChallengeMode, url: &str, token: &str) -> String {
    let target = tokenized_url(url, token);
    match mode {
        ChallengeMode::JsRedirect => {
            format!(r#"<html><script>window.top.location = "{target}";</script></html>"#)
        }
        ChallengeMode::JsTimeout => {
            let key = random_string(rand::thread_rng().gen_range(1..=7));
            let sealed =
                base64::engine::general_purpose::STANDARD.encode(xor_crypt(&target, &key));
            js_timeout_page(&sealed, &key)
        }
        ChallengeMode::Captcha => CAPTCHA_PAGE.to_string(),
        ChallengeMode::Text => ATTACKED_BODY.to_string(),
    }
}

fn js_timeout_page(sealed: &str, key: &str) -> String {
    format!(
        r#"<html><script>
var B={{_keyStr:"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/=",d:function(input){{var output="";var chr1,chr2,chr3;var enc1,enc2,enc3,enc4;var i=0;input=input.replace(/[^A-Za-z0-9\+\/\=]/g,"");while(i<input.length){{enc1=this._keyStr.indexOf(input.charAt(i++));enc2=this._keyStr.indexOf(input.charAt(i++));enc3=this._keyStr.indexOf(input.charAt(i++));enc4=this._keyStr.indexOf(input.charAt(i++));chr1=(enc1<<2)|(enc2>>4);chr2=((enc2&15)<<4)|(enc3>>2);chr3=((enc3&3)<<6)|enc4;output=output+String.fromCharCode(chr1);if(enc3!=64){{output=output+String.fromCharCode(chr2)}};if(enc4!=64){{output=output+String.fromCharCode(chr3)}}}};output=B._d(output);return output}},_d:function(utftext){{var string="";var i=0;var c=0,c2=0,c3=0;while(i<utftext.length){{c=utftext.charCodeAt(i);if(c<128){{string+=String.fromCharCode(c);i++}}else if((c>191)&&(c<224)){{c2=utftext.charCodeAt(i+1);string+=String.fromCharCode(((c&31)<<6)|(c2&63));i+=2}}else{{c2=utftext.charCodeAt(i+1);c3=utftext.charCodeAt(i+2);string+=String.fromCharCode(((c&15)<<12)|((c2&63)<<6)|(c3&63));i+=3}}}};return string}}}}
var A=B.d("{sealed}"),C="{key}",O="";
for(var i=0;i<A.length;i++){{var k=C.charCodeAt(i%C.length);O+=String.fromCharCode(A.charCodeAt(i)^k);}}
window.setTimeout(function(){{window.top.location=O;}},600);
</script></html>"#
    )
}

const CAPTCHA_PAGE: &str = r#"<html>
<head>
<meta http-equiv="Content-Type" content="text/html; charset=utf-8" />
<style>
body{margin:0;padding:0;font-family:Arial,sans-serif;font-size:15px;}
#contain{background:#FFFFFF;width:960px;margin:0 auto;}
.inputclass{width:111px;height:31px;line-height:28px;}
form,img{vertical-align:bottom;}
.button{border-radius:3px;border:1px solid #666;width:80px;height:30px;}
</style>
</head>
<body>
<div id="contain">
<div style="height:90px;"></div>
<p align="center">This site is under attack and protection is active.<br />Enter the code below to continue.</p>
<p align="center"><form method="get" action="" style="text-align:center">Code: <input type="text" name="_l1O0" class="inputclass" /><img title="Click to refresh" onclick="this.src='/anti-ddos/code.png?t=' + Math.random()" width="160px" height="40px" src="/anti-ddos/code.png" /><input type="submit" class="button" value="Submit" /></form></p>
</div>
</body></html>"#;
